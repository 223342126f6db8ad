#![forbid(unsafe_code)]

//! Client-referral transfers: instead of switching backends in-session, the
//! client is told to disconnect and reconnect to the proxy with a signed
//! referral naming the destination backend. The inbound Connect on return
//! resolves straight to the encoded backend.

use std::sync::Arc;

use numdrassl_protocol::packets::Frame;
use numdrassl_protocol::referral;
use tracing::{info, warn};

use crate::config::BackendServer;
use crate::proxy::Proxy;
use crate::session::{ProxySession, SessionState};
use crate::util::unix_ms_now;

/// The referral frame's port field is a signed 16-bit value on the wire.
pub const MAX_REFERRAL_PORT: u16 = 32767;

#[derive(Debug, Clone)]
pub struct TransferResult {
	pub success: bool,
	pub message: String,
}

impl TransferResult {
	fn ok(message: impl Into<String>) -> TransferResult {
		TransferResult {
			success: true,
			message: message.into(),
		}
	}

	fn failed(message: impl Into<String>) -> TransferResult {
		TransferResult {
			success: false,
			message: message.into(),
		}
	}
}

/// Send a ClientReferral pointing the player back at this proxy with a
/// signed destination-encoded referral blob.
pub fn transfer_by_referral(proxy: &Proxy, session: &Arc<ProxySession>, target: &BackendServer) -> TransferResult {
	if session.state() != SessionState::Connected {
		return TransferResult::failed("Player not connected");
	}

	let Some(identity) = session.identity() else {
		return TransferResult::failed("Player UUID not known");
	};

	if let Some(current) = session.current_backend() {
		if current.same_name(&target.name) {
			return TransferResult::failed("Already connected to this server");
		}
	}

	let config = proxy.config();
	let host = config.advertised_host();
	let port = config.advertised_port();

	if host == "127.0.0.1" && config.public_address.is_none() {
		warn!(session = session.id(), "no publicAddress configured, using localhost for client referral");
	}

	if port > MAX_REFERRAL_PORT {
		warn!(session = session.id(), port, "port exceeds maximum value for client referrals");
		return TransferResult::failed("Port exceeds maximum value for player transfers");
	}

	let blob = referral::sign_player_referral(
		identity.uuid,
		&identity.username,
		&target.name,
		&session.client_addr().ip().to_string(),
		unix_ms_now(),
		proxy.secret().as_bytes(),
	);

	info!(
		session = session.id(),
		player = %identity.username,
		target = %target.name,
		host = %host,
		port,
		"sending client referral"
	);

	let sent = session.send_to_client(&Frame::ClientReferral {
		host,
		port,
		referral_data: blob,
	});

	if sent {
		TransferResult::ok("Transfer initiated")
	} else {
		TransferResult::failed("Could not reach client")
	}
}
