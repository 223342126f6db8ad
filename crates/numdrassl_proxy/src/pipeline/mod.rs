#![forbid(unsafe_code)]

//! Per-stream frame pipelines.
//!
//! Every QUIC stream gets one reader loop and one writer task. Writers drain
//! a channel of pre-encoded frames, so any task can send without owning the
//! stream; when the stream dies, dropping the channel releases the queued
//! buffers.

pub mod backend;
pub mod client;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::hooks::DisconnectKind;
use crate::proxy::Proxy;
use crate::session::ProxySession;

/// Spawn the writer task for a stream and hand back its input channel.
pub(crate) fn spawn_stream_writer(mut send: quinn::SendStream, session_id: u64, label: &'static str) -> mpsc::UnboundedSender<Bytes> {
	let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

	tokio::spawn(async move {
		while let Some(bytes) = rx.recv().await {
			if let Err(e) = send.write_all(&bytes).await {
				debug!(session = session_id, stream = label, error = %e, "stream write failed, stopping writer");
				return;
			}
		}
		// All senders gone: flush what was queued and signal FIN so the
		// peer sees the final frames before the transport closes.
		let _ = send.finish();
	});

	tx
}

/// Tear a session down once: close transports, drop it from the store, and
/// fire the closed hook exactly one time.
pub(crate) async fn terminate_session(
	proxy: &Proxy,
	session: &Arc<ProxySession>,
	kind: DisconnectKind,
	reason: &str,
	notify_client: bool,
) {
	if notify_client {
		session.disconnect(reason);
	} else {
		session.close(reason);
	}

	if proxy.store().remove(session) {
		proxy.hooks().session_closed(session, kind).await;
	}
}
