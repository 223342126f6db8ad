#![forbid(unsafe_code)]

pub mod store;

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use numdrassl_protocol::framing::{MAX_FRAME_SIZE, encode_frame};
use numdrassl_protocol::packets::{Connect, Frame};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BackendServer;

/// Lifecycle of a proxied session.
///
/// `Disconnected` is terminal; any state may transition into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Handshaking,
	Authenticating,
	Connecting,
	Connected,
	Transferring,
	Disconnected,
}

/// Player identity captured from the Connect frame.
#[derive(Debug, Clone)]
pub struct PlayerIdentity {
	pub uuid: Uuid,
	pub username: String,
	pub protocol_hash: String,
	pub identity_token: String,
}

/// Tokens captured during the client↔proxy authentication legs.
#[derive(Debug, Default, Clone)]
pub struct AuthTokens {
	pub client_auth_grant: Option<String>,
	pub client_access_token: Option<String>,
	pub server_access_token: Option<String>,
}

/// Handle to the currently attached backend stream.
///
/// The generation lets a stale backend reader detect that it has been
/// replaced: during a transfer the old link's reader observes EOF but must
/// not touch the session once a newer generation is installed.
pub struct BackendLink {
	pub connection: quinn::Connection,
	pub tx: mpsc::UnboundedSender<Bytes>,
	pub generation: u64,
}

/// A single client↔proxy↔backend triple.
///
/// All mutable fields sit behind short-lived locks; frame writes are handed
/// to per-stream writer tasks through channels, so any task may send without
/// touching stream state directly.
pub struct ProxySession {
	id: u64,
	client_addr: SocketAddr,
	client_connection: quinn::Connection,
	client_cert_fingerprint: Option<String>,

	state: Mutex<SessionState>,
	transferring: AtomicBool,

	client_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
	backend: Mutex<Option<BackendLink>>,
	backend_generation: AtomicU64,

	identity: Mutex<Option<PlayerIdentity>>,
	original_connect: Mutex<Option<Connect>>,
	auth: Mutex<AuthTokens>,
	current_backend: Mutex<Option<BackendServer>>,
	previous_backend: Mutex<Option<BackendServer>>,
}

impl ProxySession {
	pub fn new(id: u64, client_connection: quinn::Connection) -> ProxySession {
		let client_addr = client_connection.remote_address();
		let client_cert_fingerprint = crate::quic::peer_fingerprint(&client_connection);
		if let Some(fp) = &client_cert_fingerprint {
			debug!(session = id, fingerprint = %fp, "client certificate fingerprint");
		}

		ProxySession {
			id,
			client_addr,
			client_connection,
			client_cert_fingerprint,
			state: Mutex::new(SessionState::Handshaking),
			transferring: AtomicBool::new(false),
			client_tx: Mutex::new(None),
			backend: Mutex::new(None),
			backend_generation: AtomicU64::new(0),
			identity: Mutex::new(None),
			original_connect: Mutex::new(None),
			auth: Mutex::new(AuthTokens::default()),
			current_backend: Mutex::new(None),
			previous_backend: Mutex::new(None),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn client_addr(&self) -> SocketAddr {
		self.client_addr
	}

	pub fn client_connection(&self) -> &quinn::Connection {
		&self.client_connection
	}

	pub fn client_cert_fingerprint(&self) -> Option<String> {
		self.client_cert_fingerprint.clone()
	}

	pub fn state(&self) -> SessionState {
		*self.state.lock().expect("state lock")
	}

	pub fn set_state(&self, new_state: SessionState) {
		let mut guard = self.state.lock().expect("state lock");
		// DISCONNECTED is terminal.
		if *guard == SessionState::Disconnected {
			return;
		}
		let old = *guard;
		*guard = new_state;
		drop(guard);
		debug!(session = self.id, ?old, state = ?new_state, "session state changed");
	}

	pub fn is_transferring(&self) -> bool {
		self.transferring.load(Ordering::Acquire)
	}

	pub fn set_transferring(&self, value: bool) {
		self.transferring.store(value, Ordering::Release);
	}

	// ---- player info -------------------------------------------------------

	pub fn identity(&self) -> Option<PlayerIdentity> {
		self.identity.lock().expect("identity lock").clone()
	}

	pub fn player_uuid(&self) -> Option<Uuid> {
		self.identity.lock().expect("identity lock").as_ref().map(|p| p.uuid)
	}

	pub fn username(&self) -> Option<String> {
		self.identity.lock().expect("identity lock").as_ref().map(|p| p.username.clone())
	}

	/// Capture identity from the Connect frame and keep the frame for replay
	/// during backend connect.
	pub fn record_connect(&self, connect: &Connect) {
		*self.identity.lock().expect("identity lock") = Some(PlayerIdentity {
			uuid: connect.uuid,
			username: connect.username.clone(),
			protocol_hash: connect.protocol_hash.clone(),
			identity_token: connect.identity_token.clone(),
		});
		*self.original_connect.lock().expect("connect lock") = Some(connect.clone());
	}

	pub fn original_connect(&self) -> Option<Connect> {
		self.original_connect.lock().expect("connect lock").clone()
	}

	pub fn auth_tokens(&self) -> AuthTokens {
		self.auth.lock().expect("auth lock").clone()
	}

	pub fn update_auth<F: FnOnce(&mut AuthTokens)>(&self, f: F) {
		let mut guard = self.auth.lock().expect("auth lock");
		f(&mut guard);
	}

	pub fn current_backend(&self) -> Option<BackendServer> {
		self.current_backend.lock().expect("backend lock").clone()
	}

	pub fn set_current_backend(&self, backend: Option<BackendServer>) {
		*self.current_backend.lock().expect("backend lock") = backend;
	}

	pub fn previous_backend(&self) -> Option<BackendServer> {
		self.previous_backend.lock().expect("backend lock").clone()
	}

	pub fn set_previous_backend(&self, backend: Option<BackendServer>) {
		*self.previous_backend.lock().expect("backend lock") = backend;
	}

	/// Latency tracking is not implemented; always unknown.
	pub fn ping_ms(&self) -> Option<u64> {
		None
	}

	// ---- stream plumbing ---------------------------------------------------

	pub fn set_client_stream(&self, tx: mpsc::UnboundedSender<Bytes>) {
		*self.client_tx.lock().expect("client tx lock") = Some(tx);
	}

	/// Allocate the generation for the next backend link.
	pub fn next_backend_generation(&self) -> u64 {
		self.backend_generation.fetch_add(1, Ordering::AcqRel) + 1
	}

	pub fn current_backend_generation(&self) -> u64 {
		self.backend_generation.load(Ordering::Acquire)
	}

	/// Publish a backend link. The previous link, if any, must already be
	/// closed by the caller.
	pub fn install_backend(&self, link: BackendLink) {
		*self.backend.lock().expect("backend link lock") = Some(link);
	}

	/// Close and drop the current backend transport without touching the
	/// client side.
	pub fn close_backend(&self) {
		if let Some(link) = self.backend.lock().expect("backend link lock").take() {
			link.connection.close(0u32.into(), b"");
		}
	}

	pub fn send_to_client(&self, frame: &Frame) -> bool {
		match encode_frame(frame, MAX_FRAME_SIZE) {
			Ok(bytes) => self.send_to_client_raw(bytes),
			Err(e) => {
				warn!(session = self.id, frame = frame.name(), error = %e, "failed to encode client frame");
				false
			}
		}
	}

	pub fn send_to_client_raw(&self, bytes: Bytes) -> bool {
		let guard = self.client_tx.lock().expect("client tx lock");
		match guard.as_ref() {
			Some(tx) => tx.send(bytes).is_ok(),
			None => {
				warn!(session = self.id, "cannot send to client: stream not attached");
				false
			}
		}
	}

	pub fn send_to_backend(&self, frame: &Frame) -> bool {
		match encode_frame(frame, MAX_FRAME_SIZE) {
			Ok(bytes) => self.send_to_backend_raw(bytes),
			Err(e) => {
				warn!(session = self.id, frame = frame.name(), error = %e, "failed to encode backend frame");
				false
			}
		}
	}

	pub fn send_to_backend_raw(&self, bytes: Bytes) -> bool {
		let guard = self.backend.lock().expect("backend link lock");
		match guard.as_ref() {
			Some(link) => link.tx.send(bytes).is_ok(),
			None => {
				warn!(session = self.id, "cannot send to backend: stream not attached");
				false
			}
		}
	}

	// ---- lifecycle ---------------------------------------------------------

	pub fn is_active(&self) -> bool {
		self.state() != SessionState::Disconnected
	}

	/// Close both transports, backend first. Safe to call more than once.
	pub fn close(&self, reason: &str) {
		{
			let mut guard = self.state.lock().expect("state lock");
			if *guard == SessionState::Disconnected {
				return;
			}
			*guard = SessionState::Disconnected;
		}
		debug!(session = self.id, reason, "closing session");

		if let Some(link) = self.backend.lock().expect("backend link lock").take() {
			link.connection.close(0u32.into(), b"");
		}
		self.client_connection.close(0u32.into(), reason.as_bytes());
	}

	/// Close the session, surfacing the reason to the client as a Disconnect
	/// frame before tearing the transports down.
	///
	/// The frame is queued, the writer drains and finishes the stream, and
	/// the transport is closed shortly after so the frame actually reaches
	/// the peer. Must run inside the runtime.
	pub fn disconnect(&self, reason: &str) {
		{
			let mut guard = self.state.lock().expect("state lock");
			if *guard == SessionState::Disconnected {
				return;
			}
			*guard = SessionState::Disconnected;
		}
		debug!(session = self.id, reason, "disconnecting session");

		// Backend first.
		if let Some(link) = self.backend.lock().expect("backend link lock").take() {
			link.connection.close(0u32.into(), b"");
		}

		// Dropping the sender lets the writer flush the queued frame and
		// finish the stream before the transport goes away.
		if let Some(tx) = self.client_tx.lock().expect("client tx lock").take() {
			if let Ok(bytes) = encode_frame(
				&Frame::Disconnect {
					reason: reason.to_string(),
				},
				MAX_FRAME_SIZE,
			) {
				let _ = tx.send(bytes);
			}
		}

		let connection = self.client_connection.clone();
		let reason = reason.to_string();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(500)).await;
			connection.close(0u32.into(), reason.as_bytes());
		});
	}
}

impl std::fmt::Debug for ProxySession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxySession")
			.field("id", &self.id)
			.field("client_addr", &self.client_addr)
			.field("state", &self.state())
			.finish()
	}
}
