#![forbid(unsafe_code)]

//! Hook points consumed by the out-of-scope extension layer.
//!
//! The extension layer registers one `ProxyHooks` implementation at startup;
//! every method has a pass-through default so implementations only override
//! what they care about.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use numdrassl_protocol::packets::Frame;

use crate::cluster::server_list::RegisteredServer;
use crate::config::BackendServer;
use crate::session::ProxySession;

/// Outcome of the pre-login hook.
#[derive(Debug, Clone)]
pub enum LoginDecision {
	Allow,
	Deny { reason: String },
}

/// Outcome of the pre-connect hook.
#[derive(Debug, Clone)]
pub enum ConnectDecision {
	Allow,
	Deny { reason: String },
	/// Route the session to a different named backend instead.
	Redirect { backend_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
	ClientToBackend,
	BackendToClient,
}

/// What to do with an intercepted frame.
pub enum PacketAction {
	Forward(Frame),
	Drop,
}

/// Why a session ended, surfaced to the disconnect hook.
#[derive(Debug, Clone)]
pub enum DisconnectKind {
	ClientQuit,
	BackendClosed,
	AuthFailed { reason: String },
	PolicyDenied { reason: String },
	ProtocolViolation,
	Other { reason: String },
}

#[async_trait]
pub trait ProxyHooks: Send + Sync {
	async fn pre_login(&self, _client_addr: SocketAddr) -> LoginDecision {
		LoginDecision::Allow
	}

	/// Advisory; fired once the backend accepted the session.
	async fn post_login(&self, _session: &Arc<ProxySession>) {}

	async fn pre_connect(&self, _session: &Arc<ProxySession>, _backend: &BackendServer) -> ConnectDecision {
		ConnectDecision::Allow
	}

	async fn server_connected(&self, _session: &Arc<ProxySession>, _backend: &BackendServer, _previous: Option<BackendServer>) {
	}

	/// Advisory; fired when a session leaves the store.
	async fn session_closed(&self, _session: &Arc<ProxySession>, _kind: DisconnectKind) {}

	/// Called for every intercepted frame once the session is CONNECTED; may
	/// rewrite or drop it. Must not block.
	fn map_packet(&self, _session: &Arc<ProxySession>, frame: Frame, _direction: PacketDirection) -> PacketAction {
		PacketAction::Forward(frame)
	}

	/// A plugin message arrived on a registered control channel.
	async fn plugin_message(&self, _channel: &str, _server: &RegisteredServer, _payload: &[u8]) {}
}

/// Default hooks: allow everything, observe nothing.
pub struct NoopHooks;

#[async_trait]
impl ProxyHooks for NoopHooks {}
