#![forbid(unsafe_code)]

//! Client-facing QUIC acceptor.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::hooks::DisconnectKind;
use crate::pipeline::{client, terminate_session};
use crate::proxy::Proxy;
use crate::session::ProxySession;

/// Accept client connections until the endpoint closes.
///
/// Connections beyond the configured cap are refused before the handshake
/// completes: no session is created and no events fire.
pub async fn run_listener(proxy: Proxy) -> anyhow::Result<()> {
	let endpoint = proxy.server_endpoint();
	info!(addr = %endpoint.local_addr()?, "listening for client connections");

	while let Some(incoming) = endpoint.accept().await {
		if proxy.store().count() >= proxy.config().max_connections {
			warn!(remote = %incoming.remote_address(), "max connections reached, refusing connection");
			metrics::counter!("numdrassl_connections_refused_total").increment(1);
			incoming.refuse();
			continue;
		}

		let proxy = proxy.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => handle_connection(proxy, connection).await,
				Err(e) => debug!(error = %e, "client connection failed during handshake"),
			}
		});
	}

	Ok(())
}

async fn handle_connection(proxy: Proxy, connection: quinn::Connection) {
	let session = Arc::new(ProxySession::new(proxy.next_session_id(), connection.clone()));
	proxy.store().insert(Arc::clone(&session));
	metrics::counter!("numdrassl_connections_total").increment(1);

	info!(
		session = session.id(),
		remote = %connection.remote_address(),
		"new client connection"
	);

	// Transport-level close also tears the session down, covering clients
	// that never open a stream.
	{
		let proxy = proxy.clone();
		let session = Arc::clone(&session);
		let connection = connection.clone();
		tokio::spawn(async move {
			let reason = connection.closed().await;
			debug!(session = session.id(), %reason, "client transport closed");
			terminate_session(&proxy, &session, DisconnectKind::ClientQuit, "Connection closed", false).await;
		});
	}

	// Every opened bidirectional stream gets its own pipeline attached to
	// the owning session.
	loop {
		match connection.accept_bi().await {
			Ok((send, recv)) => {
				tokio::spawn(client::run_client_stream(proxy.clone(), Arc::clone(&session), send, recv));
			}
			Err(e) => {
				debug!(session = session.id(), error = %e, "no more client streams");
				break;
			}
		}
	}
}
