#![forbid(unsafe_code)]

//! Client-side frame handling: the session state machine's input from the
//! downstream player connection.
//!
//! Authentication flow (client ↔ proxy):
//! 1. Client sends Connect (identity token, uuid, username).
//! 2. Proxy requests an authorization grant from the session service.
//! 3. Proxy sends AuthGrant (authorization grant, server identity token).
//! 4. Client sends AuthToken (access token, server authorization grant).
//! 5. Proxy exchanges the server authorization grant.
//! 6. Proxy sends ServerAuthToken (server access token).
//!
//! The proxy ↔ backend leg uses an HMAC-signed referral instead.

use std::sync::Arc;

use bytes::BytesMut;
use numdrassl_protocol::framing::{MAX_FRAME_SIZE, try_decode_frame};
use numdrassl_protocol::packets::{Connect, Frame};
use numdrassl_protocol::referral;
use tracing::{debug, info, warn};

use super::{spawn_stream_writer, terminate_session};
use crate::backend::dialer;
use crate::config::BackendServer;
use crate::hooks::{ConnectDecision, DisconnectKind, LoginDecision, PacketAction, PacketDirection};
use crate::proxy::Proxy;
use crate::session::{ProxySession, SessionState};
use crate::util::unix_ms_now;

/// Drive one client bidirectional stream until it closes.
pub async fn run_client_stream(proxy: Proxy, session: Arc<ProxySession>, send: quinn::SendStream, mut recv: quinn::RecvStream) {
	let tx = spawn_stream_writer(send, session.id(), "client");
	session.set_client_stream(tx);
	debug!(session = session.id(), "client stream initialized");

	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => break,
			Err(e) => {
				debug!(session = session.id(), error = %e, "client stream read failed");
				break;
			}
		};
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame(&mut buf, MAX_FRAME_SIZE) {
				Ok(Some(frame)) => {
					handle_client_frame(&proxy, &session, frame).await;
					if session.state() == SessionState::Disconnected {
						return;
					}
				}
				Ok(None) => break,
				Err(e) => {
					warn!(session = session.id(), error = %e, "malformed client frame");
					metrics::counter!("numdrassl_protocol_violations_total").increment(1);
					terminate_session(&proxy, &session, DisconnectKind::ProtocolViolation, "Protocol violation", false).await;
					return;
				}
			}
		}
	}

	info!(session = session.id(), "client stream closed");
	terminate_session(&proxy, &session, DisconnectKind::ClientQuit, "Client disconnected", false).await;
}

async fn handle_client_frame(proxy: &Proxy, session: &Arc<ProxySession>, frame: Frame) {
	match frame {
		Frame::Connect(connect) => handle_connect(proxy, session, connect).await,
		Frame::AuthToken {
			access_token,
			server_authorization_grant,
		} => handle_auth_token(proxy, session, access_token, server_authorization_grant).await,
		Frame::Disconnect { reason } => {
			info!(session = session.id(), "client disconnecting");
			if session.state() == SessionState::Connected {
				session.send_to_backend(&Frame::Disconnect { reason });
			}
			terminate_session(proxy, session, DisconnectKind::ClientQuit, "Client disconnected", false).await;
		}
		Frame::Raw { packet_id, body } => {
			// Unknown frames pass through verbatim once the session is live.
			if session.state() == SessionState::Connected {
				if proxy.config().debug_mode {
					debug!(session = session.id(), packet_id, len = body.len(), "forwarding raw client frame");
				}
				metrics::counter!("numdrassl_frames_forwarded_total", "direction" => "client_to_backend").increment(1);
				session.send_to_backend(&Frame::Raw { packet_id, body });
			} else {
				debug!(
					session = session.id(),
					packet_id,
					state = ?session.state(),
					"dropping raw client frame before session is connected"
				);
			}
		}
		other => {
			if session.state() == SessionState::Connected {
				match proxy.hooks().map_packet(session, other, PacketDirection::ClientToBackend) {
					PacketAction::Forward(mapped) => {
						metrics::counter!("numdrassl_frames_forwarded_total", "direction" => "client_to_backend").increment(1);
						session.send_to_backend(&mapped);
					}
					PacketAction::Drop => {}
				}
			} else {
				debug!(
					session = session.id(),
					frame = other.name(),
					state = ?session.state(),
					"dropping client frame, session not connected"
				);
			}
		}
	}
}

/// Connect: capture identity, consult the pre-login hook, then ask the
/// session service for an authorization grant.
async fn handle_connect(proxy: &Proxy, session: &Arc<ProxySession>, connect: Connect) {
	if session.state() != SessionState::Handshaking {
		warn!(session = session.id(), state = ?session.state(), "unexpected Connect, ignoring");
		return;
	}

	info!(
		session = session.id(),
		username = %connect.username,
		uuid = %connect.uuid,
		"received Connect"
	);

	session.record_connect(&connect);
	session.set_state(SessionState::Authenticating);

	// Visibility registration; conflicts are resolved at backend accept.
	proxy.store().register_uuid(session);

	if let LoginDecision::Deny { reason } = proxy.hooks().pre_login(session.client_addr()).await {
		info!(session = session.id(), reason = %reason, "pre-login denied");
		terminate_session(proxy, session, DisconnectKind::PolicyDenied { reason: reason.clone() }, &reason, true).await;
		return;
	}

	if connect.identity_token.is_empty() {
		// The session service gets the final say.
		warn!(session = session.id(), "client has no identity token");
	}

	let grant = match proxy
		.session_service()
		.request_auth_grant(connect.uuid, &connect.username, Some(connect.identity_token.as_str()))
		.await
	{
		Ok(grant) => grant,
		Err(e) => {
			warn!(session = session.id(), error = %e, "auth grant request failed");
			metrics::counter!("numdrassl_auth_failures_total").increment(1);
			terminate_session(
				proxy,
				session,
				DisconnectKind::AuthFailed {
					reason: "Authentication failed".to_string(),
				},
				"Authentication failed",
				true,
			)
			.await;
			return;
		}
	};

	session.update_auth(|auth| auth.client_auth_grant = Some(grant.authorization_grant.clone()));
	session.send_to_client(&Frame::AuthGrant {
		authorization_grant: grant.authorization_grant,
		server_identity_token: grant.server_identity_token,
	});
}

/// AuthToken: store the client access token, exchange the server grant when
/// present, then move on to the backend connect.
async fn handle_auth_token(proxy: &Proxy, session: &Arc<ProxySession>, access_token: String, server_authorization_grant: String) {
	if session.state() != SessionState::Authenticating {
		warn!(session = session.id(), state = ?session.state(), "unexpected AuthToken, ignoring");
		return;
	}

	if access_token.is_empty() {
		terminate_session(
			proxy,
			session,
			DisconnectKind::AuthFailed {
				reason: "Invalid access token".to_string(),
			},
			"Invalid access token",
			true,
		)
		.await;
		return;
	}

	session.update_auth(|auth| auth.client_access_token = Some(access_token));

	if server_authorization_grant.is_empty() {
		// Some flows skip mutual auth; proceed with a null server token.
		debug!(session = session.id(), "no server authorization grant, skipping exchange");
		session.send_to_client(&Frame::ServerAuthToken { server_access_token: None });
		connect_backend(proxy, session).await;
		return;
	}

	match proxy.session_service().exchange_server_grant(&server_authorization_grant).await {
		Ok(server_access_token) => {
			session.update_auth(|auth| auth.server_access_token = Some(server_access_token.clone()));
			session.send_to_client(&Frame::ServerAuthToken {
				server_access_token: Some(server_access_token),
			});
			connect_backend(proxy, session).await;
		}
		Err(e) => {
			warn!(session = session.id(), error = %e, "server grant exchange failed");
			metrics::counter!("numdrassl_auth_failures_total").increment(1);
			terminate_session(
				proxy,
				session,
				DisconnectKind::AuthFailed {
					reason: "Server authentication failed".to_string(),
				},
				"Server authentication failed",
				true,
			)
			.await;
		}
	}
}

/// Resolve the target backend (referral, then default) and dial it.
async fn connect_backend(proxy: &Proxy, session: &Arc<ProxySession>) {
	let Some(connect) = session.original_connect() else {
		warn!(session = session.id(), "no stored Connect frame");
		terminate_session(
			proxy,
			session,
			DisconnectKind::Other {
				reason: "Internal error".to_string(),
			},
			"Internal error",
			true,
		)
		.await;
		return;
	};

	let mut backend: Option<BackendServer> = None;

	if let Some(referral_data) = connect.referral_data.as_deref() {
		match referral::decode_player_referral(referral_data, unix_ms_now(), proxy.secret().as_bytes()) {
			Ok(r) if r.uuid == connect.uuid && r.username == connect.username => {
				info!(
					session = session.id(),
					target = %r.backend_name,
					"consuming transfer referral"
				);
				backend = proxy.find_backend(&r.backend_name);
				if backend.is_none() {
					warn!(session = session.id(), target = %r.backend_name, "referral names an unknown backend");
				}
			}
			Ok(_) => {
				warn!(session = session.id(), "referral identity mismatch");
				terminate_session(
					proxy,
					session,
					DisconnectKind::AuthFailed {
						reason: "Invalid referral".to_string(),
					},
					"Invalid referral",
					true,
				)
				.await;
				return;
			}
			Err(e) => {
				warn!(session = session.id(), error = %e, "rejecting referral");
				terminate_session(
					proxy,
					session,
					DisconnectKind::AuthFailed {
						reason: "Invalid referral".to_string(),
					},
					"Invalid referral",
					true,
				)
				.await;
				return;
			}
		}
	}

	let backend = match backend.or_else(|| proxy.config().default_backend().cloned()) {
		Some(backend) => backend,
		None => {
			warn!(session = session.id(), "no backend server available");
			terminate_session(
				proxy,
				session,
				DisconnectKind::Other {
					reason: "No backend server available".to_string(),
				},
				"No backend server available",
				true,
			)
			.await;
			return;
		}
	};

	let backend = match apply_pre_connect(proxy, session, backend).await {
		Some(backend) => backend,
		None => return,
	};

	session.set_current_backend(Some(backend.clone()));
	session.set_state(SessionState::Connecting);
	dialer::connect(proxy, session, backend, connect, false).await;
}

/// Run the pre-connect hook, honoring deny and redirect outcomes.
pub(crate) async fn apply_pre_connect(proxy: &Proxy, session: &Arc<ProxySession>, backend: BackendServer) -> Option<BackendServer> {
	match proxy.hooks().pre_connect(session, &backend).await {
		ConnectDecision::Allow => Some(backend),
		ConnectDecision::Deny { reason } => {
			info!(session = session.id(), reason = %reason, "pre-connect denied");
			terminate_session(proxy, session, DisconnectKind::PolicyDenied { reason: reason.clone() }, &reason, true).await;
			None
		}
		ConnectDecision::Redirect { backend_name } => match proxy.find_backend(&backend_name) {
			Some(redirected) => {
				info!(session = session.id(), target = %backend_name, "pre-connect redirect");
				Some(redirected)
			}
			None => {
				warn!(session = session.id(), target = %backend_name, "redirect names an unknown backend");
				terminate_session(
					proxy,
					session,
					DisconnectKind::Other {
						reason: "No backend server available".to_string(),
					},
					"No backend server available",
					true,
				)
				.await;
				None
			}
		},
	}
}
