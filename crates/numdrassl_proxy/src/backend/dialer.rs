#![forbid(unsafe_code)]

//! Dials backend game servers on behalf of sessions.
//!
//! The dialed transport presents the same certificate the client listener
//! serves: backends pin the proxy by fingerprint. The Connect forwarded to
//! the backend is the session's original frame with its referral field
//! replaced by a freshly signed player-info blob; the identity token is kept
//! as-is since backends may still want it for identity purposes.

use std::sync::Arc;
use std::time::Duration;

use numdrassl_protocol::packets::{ChatType, Connect, Frame, MessageSegment};
use numdrassl_protocol::referral;
use tokio::net::lookup_host;
use tracing::{info, warn};

use crate::config::BackendServer;
use crate::hooks::{ConnectDecision, DisconnectKind};
use crate::pipeline::{backend as backend_pipeline, spawn_stream_writer, terminate_session};
use crate::proxy::Proxy;
use crate::session::{BackendLink, ProxySession, SessionState};
use crate::util::unix_ms_now;

/// Establish a backend connection for a session and forward the rewritten
/// Connect. `is_transfer` selects the failure semantics: a failed transfer
/// reverts the session to its previous backend instead of disconnecting.
pub async fn connect(proxy: &Proxy, session: &Arc<ProxySession>, backend: BackendServer, connect_frame: Connect, is_transfer: bool) {
	info!(
		session = session.id(),
		backend = %backend.name,
		host = %backend.host,
		port = backend.port,
		"connecting to backend"
	);

	let timeout = Duration::from_secs(proxy.config().connection_timeout_seconds);

	let connection = match tokio::time::timeout(timeout, dial(proxy, &backend)).await {
		Ok(Ok(connection)) => connection,
		Ok(Err(e)) => {
			warn!(session = session.id(), backend = %backend.name, error = %e, "backend dial failed");
			fail(proxy, session, &backend, is_transfer).await;
			return;
		}
		Err(_) => {
			warn!(session = session.id(), backend = %backend.name, "backend dial timed out");
			fail(proxy, session, &backend, is_transfer).await;
			return;
		}
	};

	let (send, recv) = match connection.open_bi().await {
		Ok(streams) => streams,
		Err(e) => {
			warn!(session = session.id(), backend = %backend.name, error = %e, "failed to open backend stream");
			connection.close(0u32.into(), b"");
			fail(proxy, session, &backend, is_transfer).await;
			return;
		}
	};

	let generation = session.next_backend_generation();
	let tx = spawn_stream_writer(send, session.id(), "backend");
	session.install_backend(BackendLink {
		connection: connection.clone(),
		tx,
		generation,
	});
	session.set_current_backend(Some(backend.clone()));

	tokio::spawn(backend_pipeline::run_backend_stream(proxy.clone(), Arc::clone(session), generation, recv));

	let rewritten = signed_connect(proxy, session, &backend, connect_frame);
	info!(
		session = session.id(),
		backend = %backend.name,
		"backend stream created, forwarding Connect with signed referral"
	);
	session.send_to_backend(&Frame::Connect(rewritten));
}

/// In-session backend switch. Returns false without side effects when the
/// session is not CONNECTED or already sits on the named backend.
pub async fn switch_backend(proxy: &Proxy, session: &Arc<ProxySession>, new_backend: BackendServer) -> bool {
	let state = session.state();
	if state != SessionState::Connected {
		warn!(session = session.id(), ?state, "cannot switch servers, not connected");
		return false;
	}

	let current = session.current_backend();
	if let Some(current) = &current {
		if current.same_name(&new_backend.name) {
			warn!(session = session.id(), backend = %new_backend.name, "already connected to this server");
			return false;
		}
	}

	// Pre-connect hook with transfer semantics: a deny reverts the session.
	let target = match proxy.hooks().pre_connect(session, &new_backend).await {
		ConnectDecision::Allow => new_backend,
		ConnectDecision::Deny { reason } => {
			info!(session = session.id(), reason = %reason, "server transfer denied");
			session.send_to_client(&transfer_failed_message(&new_backend.name));
			return false;
		}
		ConnectDecision::Redirect { backend_name } => match proxy.find_backend(&backend_name) {
			Some(redirected) => redirected,
			None => {
				warn!(session = session.id(), target = %backend_name, "transfer redirect names an unknown backend");
				session.send_to_client(&transfer_failed_message(&new_backend.name));
				return false;
			}
		},
	};

	let Some(identity) = session.identity() else {
		warn!(session = session.id(), "cannot switch servers, player identity unknown");
		return false;
	};

	info!(
		session = session.id(),
		from = current.as_ref().map(|b| b.name.as_str()).unwrap_or("none"),
		to = %target.name,
		"initiating server switch"
	);
	metrics::counter!("numdrassl_transfers_started_total").increment(1);

	session.set_previous_backend(current);
	session.set_state(SessionState::Transferring);
	session.set_transferring(true);

	// The old transport is fully closed before the replacement is dialed.
	session.close_backend();

	let forged = Connect {
		uuid: identity.uuid,
		username: identity.username,
		protocol_hash: identity.protocol_hash,
		identity_token: identity.identity_token,
		referral_data: None,
	};

	session.set_state(SessionState::Connecting);
	connect(proxy, session, target, forged, true).await;
	true
}

async fn dial(proxy: &Proxy, backend: &BackendServer) -> anyhow::Result<quinn::Connection> {
	let addr = lookup_host((backend.host.as_str(), backend.port))
		.await?
		.next()
		.ok_or_else(|| anyhow::anyhow!("no address for {}:{}", backend.host, backend.port))?;

	let connecting = proxy.dial_endpoint().connect(addr, backend.sni_name())?;
	Ok(connecting.await?)
}

fn signed_connect(proxy: &Proxy, session: &Arc<ProxySession>, backend: &BackendServer, original: Connect) -> Connect {
	let referral = referral::sign_player_referral(
		original.uuid,
		&original.username,
		&backend.name,
		&session.client_addr().ip().to_string(),
		unix_ms_now(),
		proxy.secret().as_bytes(),
	);

	let mut rewritten = original;
	rewritten.referral_data = Some(referral);
	rewritten
}

async fn fail(proxy: &Proxy, session: &Arc<ProxySession>, backend: &BackendServer, is_transfer: bool) {
	metrics::counter!("numdrassl_backend_dial_failures_total").increment(1);

	if is_transfer {
		// Keep the client: revert and let them retry later.
		session.set_transferring(false);
		if session.state() != SessionState::Disconnected {
			session.set_state(SessionState::Connected);
		}
		session.send_to_client(&transfer_failed_message(&backend.name));
	} else {
		terminate_session(
			proxy,
			session,
			DisconnectKind::Other {
				reason: "Failed to connect to backend server".to_string(),
			},
			"Failed to connect to backend server",
			true,
		)
		.await;
	}
}

/// Gold/green transfer notification shown on success.
pub fn connecting_message(server_name: &str) -> Frame {
	Frame::ServerMessage {
		chat_type: ChatType::Chat,
		segments: vec![
			MessageSegment {
				text: "Connecting to ".to_string(),
				color: Some("#FFAA00".to_string()),
				bold: false,
			},
			MessageSegment {
				text: server_name.to_string(),
				color: Some("#55FF55".to_string()),
				bold: true,
			},
			MessageSegment {
				text: "...".to_string(),
				color: Some("#FFAA00".to_string()),
				bold: false,
			},
		],
	}
}

/// Red failure notification for a transfer that could not complete.
pub fn transfer_failed_message(server_name: &str) -> Frame {
	Frame::ServerMessage {
		chat_type: ChatType::Chat,
		segments: vec![
			MessageSegment {
				text: "Failed to connect to ".to_string(),
				color: Some("#FF5555".to_string()),
				bold: false,
			},
			MessageSegment {
				text: server_name.to_string(),
				color: Some("#FFAA00".to_string()),
				bold: true,
			},
			MessageSegment {
				text: ". Please try again later.".to_string(),
				color: Some("#FF5555".to_string()),
				bold: false,
			},
		],
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transfer_messages_carry_server_name() {
		match connecting_message("arena") {
			Frame::ServerMessage { segments, .. } => {
				assert_eq!(segments.len(), 3);
				assert_eq!(segments[1].text, "arena");
				assert!(segments[1].bold);
			}
			other => panic!("unexpected frame: {other:?}"),
		}

		match transfer_failed_message("arena") {
			Frame::ServerMessage { segments, .. } => {
				assert_eq!(segments[0].text, "Failed to connect to ");
				assert_eq!(segments[1].text, "arena");
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}
