#![forbid(unsafe_code)]

//! Backend-side frame handling.
//!
//! The backend validates the player through the HMAC-signed referral inside
//! the rewritten Connect, so this side never re-runs authentication: it waits
//! for ConnectAccept, then brokers frames.

use std::sync::Arc;

use bytes::BytesMut;
use numdrassl_protocol::framing::{MAX_FRAME_SIZE, try_decode_frame};
use numdrassl_protocol::packets::Frame;
use tracing::{debug, info, warn};

use super::terminate_session;
use crate::backend::dialer;
use crate::hooks::{DisconnectKind, PacketAction, PacketDirection};
use crate::proxy::Proxy;
use crate::session::{ProxySession, SessionState};

/// Drive one backend bidirectional stream until it closes.
///
/// `generation` identifies the backend link this reader belongs to; once the
/// session has moved on to a newer link (a transfer), a stale reader must
/// not touch session state on its way out.
pub async fn run_backend_stream(proxy: Proxy, session: Arc<ProxySession>, generation: u64, mut recv: quinn::RecvStream) {
	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => break,
			Err(e) => {
				debug!(session = session.id(), error = %e, "backend stream read failed");
				break;
			}
		};
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame(&mut buf, MAX_FRAME_SIZE) {
				Ok(Some(frame)) => {
					handle_backend_frame(&proxy, &session, generation, frame).await;
					if session.state() == SessionState::Disconnected {
						return;
					}
				}
				Ok(None) => break,
				Err(e) => {
					warn!(session = session.id(), error = %e, "malformed backend frame");
					metrics::counter!("numdrassl_protocol_violations_total").increment(1);
					terminate_session(&proxy, &session, DisconnectKind::ProtocolViolation, "Protocol violation", true).await;
					return;
				}
			}
		}
	}

	info!(session = session.id(), "backend stream closed");

	// Only the live link's reader may take the session down; during a
	// transfer the old backend's EOF is expected and ignored.
	if generation == session.current_backend_generation()
		&& !session.is_transferring()
		&& session.state() != SessionState::Disconnected
	{
		terminate_session(&proxy, &session, DisconnectKind::BackendClosed, "Backend connection lost", true).await;
	}
}

async fn handle_backend_frame(proxy: &Proxy, session: &Arc<ProxySession>, generation: u64, frame: Frame) {
	if generation != session.current_backend_generation() {
		debug!(session = session.id(), generation, "dropping frame from stale backend link");
		return;
	}

	match frame {
		Frame::ConnectAccept => handle_connect_accept(proxy, session).await,
		Frame::Disconnect { reason } => handle_backend_disconnect(proxy, session, reason).await,
		Frame::Raw { packet_id, body } => {
			if proxy.config().debug_mode {
				debug!(session = session.id(), packet_id, len = body.len(), "forwarding raw backend frame");
			}
			metrics::counter!("numdrassl_frames_forwarded_total", "direction" => "backend_to_client").increment(1);
			session.send_to_client(&Frame::Raw { packet_id, body });
		}
		other => match proxy.hooks().map_packet(session, other, PacketDirection::BackendToClient) {
			PacketAction::Forward(mapped) => {
				metrics::counter!("numdrassl_frames_forwarded_total", "direction" => "backend_to_client").increment(1);
				session.send_to_client(&mapped);
			}
			PacketAction::Drop => {}
		},
	}
}

/// ConnectAccept: the backend trusts the referral; the session goes live.
///
/// The frame is not forwarded: the client already finished its handshake
/// against the proxy and is not expecting it.
async fn handle_connect_accept(proxy: &Proxy, session: &Arc<ProxySession>) {
	info!(session = session.id(), "backend accepted connection");

	let was_transfer = session.is_transferring();
	let previous_backend = if was_transfer { session.previous_backend() } else { None };

	// Forcing registration first: a prior live session under this uuid is
	// closed before this one enters CONNECTED.
	if let Some(displaced) = proxy.store().register_uuid_forcing(session) {
		let hooks = Arc::clone(proxy.hooks());
		tokio::spawn(async move {
			hooks
				.session_closed(
					&displaced,
					DisconnectKind::Other {
						reason: "Logged in from another location".to_string(),
					},
				)
				.await;
		});
	}

	session.set_state(SessionState::Connected);
	session.set_transferring(false);

	let backend = session.current_backend();
	proxy.hooks().post_login(session).await;
	if let Some(backend) = &backend {
		proxy.hooks().server_connected(session, backend, previous_backend).await;
	}

	if was_transfer {
		if let Some(backend) = &backend {
			// Deferred until acceptance so a failed transfer never shows a
			// success line.
			session.send_to_client(&dialer::connecting_message(&backend.name));
		}
		metrics::counter!("numdrassl_transfers_completed_total").increment(1);
	}

	debug!(session = session.id(), "not forwarding ConnectAccept to client");
}

async fn handle_backend_disconnect(proxy: &Proxy, session: &Arc<ProxySession>, reason: String) {
	info!(session = session.id(), reason = %reason, "backend disconnecting");

	if session.is_transferring() || session.state() == SessionState::Transferring {
		info!(session = session.id(), "ignoring backend disconnect during transfer");
		return;
	}

	match proxy
		.hooks()
		.map_packet(session, Frame::Disconnect { reason: reason.clone() }, PacketDirection::BackendToClient)
	{
		PacketAction::Forward(mapped) => {
			session.send_to_client(&mapped);
		}
		PacketAction::Drop => {}
	}

	terminate_session(
		proxy,
		session,
		DisconnectKind::BackendClosed,
		&format!("Backend disconnected: {reason}"),
		false,
	)
	.await;
}
