#![forbid(unsafe_code)]

//! Persistent control connections to backends for player-independent plugin
//! messaging.
//!
//! ```text
//! Proxy                          Backend (with bridge plugin)
//!   │                                  │
//!   │◄──── control connection ────────►│
//!   │      (plugin-message envelopes)  │
//!   │                                  │
//!   │◄──── player connections ────────►│
//!   │      (normal game traffic)       │
//! ```
//!
//! Each backend gets one connection holding one bidirectional stream. The
//! handshake is a control-marker referral blob wrapped in a plugin-message
//! envelope on the `numdrassl:control_handshake` channel; a periodic task
//! re-dials anything that is not ACTIVE.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use numdrassl_protocol::cluster::channels;
use numdrassl_protocol::plugin_message::PluginMessage;
use numdrassl_protocol::referral;
use numdrassl_protocol::secret::ProxySecret;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::server_list::RegisteredServer;
use crate::config::BackendServer;
use crate::hooks::ProxyHooks;
use crate::pipeline::spawn_stream_writer;
use crate::util::unix_ms_now;

/// Fixed re-probe period for inactive connections.
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
	Disconnected,
	Connecting,
	Handshaking,
	Active,
}

struct ControlConnection {
	backend: BackendServer,
	state: Mutex<ControlState>,
	link: Mutex<Option<(quinn::Connection, mpsc::UnboundedSender<Bytes>)>>,
}

impl ControlConnection {
	fn new(backend: BackendServer) -> ControlConnection {
		ControlConnection {
			backend,
			state: Mutex::new(ControlState::Disconnected),
			link: Mutex::new(None),
		}
	}

	fn state(&self) -> ControlState {
		*self.state.lock().expect("state lock")
	}

	fn set_state(&self, state: ControlState) {
		*self.state.lock().expect("state lock") = state;
	}

	fn is_active(&self) -> bool {
		self.state() == ControlState::Active
	}

	fn send(&self, message: &PluginMessage) -> bool {
		if !self.is_active() {
			return false;
		}
		let encoded = match message.encode() {
			Ok(encoded) => encoded,
			Err(e) => {
				warn!(backend = %self.backend.name, error = %e, "failed to encode plugin message");
				return false;
			}
		};
		let guard = self.link.lock().expect("link lock");
		match guard.as_ref() {
			Some((_, tx)) => tx.send(encoded).is_ok(),
			None => false,
		}
	}

	fn close(&self) {
		self.set_state(ControlState::Disconnected);
		if let Some((connection, _)) = self.link.lock().expect("link lock").take() {
			connection.close(0u32.into(), b"");
		}
	}
}

struct ControlInner {
	endpoint: quinn::Endpoint,
	secret: ProxySecret,
	hooks: Arc<dyn ProxyHooks>,
	backends: RwLock<Vec<BackendServer>>,
	connections: RwLock<HashMap<String, Arc<ControlConnection>>>,
	registered_channels: RwLock<HashSet<String>>,
	running: AtomicBool,
	reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Manages one control connection per configured backend.
#[derive(Clone)]
pub struct BackendControlManager {
	inner: Arc<ControlInner>,
}

impl BackendControlManager {
	pub fn new(
		endpoint: quinn::Endpoint,
		secret: ProxySecret,
		hooks: Arc<dyn ProxyHooks>,
		backends: Vec<BackendServer>,
	) -> BackendControlManager {
		BackendControlManager {
			inner: Arc::new(ControlInner {
				endpoint,
				secret,
				hooks,
				backends: RwLock::new(backends),
				connections: RwLock::new(HashMap::new()),
				registered_channels: RwLock::new(HashSet::new()),
				running: AtomicBool::new(false),
				reconnect_task: Mutex::new(None),
			}),
		}
	}

	pub fn start(&self) {
		if self.inner.running.swap(true, Ordering::AcqRel) {
			return;
		}

		info!("starting backend control connections");
		let backends: Vec<BackendServer> = self.inner.backends.read().expect("backends lock").clone();
		for backend in backends {
			self.spawn_connect(backend);
		}

		let manager = self.clone();
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(RECONNECT_PERIOD);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				manager.check_and_reconnect();
			}
		});
		*self.inner.reconnect_task.lock().expect("task lock") = Some(task);
	}

	pub fn stop(&self) {
		if !self.inner.running.swap(false, Ordering::AcqRel) {
			return;
		}

		info!("stopping backend control connections");
		if let Some(task) = self.inner.reconnect_task.lock().expect("task lock").take() {
			task.abort();
		}

		let mut connections = self.inner.connections.write().expect("connections lock");
		for connection in connections.values() {
			connection.close();
		}
		connections.clear();
	}

	/// Track a runtime-registered backend so the reconnect loop covers it.
	pub fn track_backend(&self, backend: BackendServer) {
		let mut backends = self.inner.backends.write().expect("backends lock");
		if !backends.iter().any(|b| b.same_name(&backend.name)) {
			backends.push(backend.clone());
			drop(backends);
			if self.inner.running.load(Ordering::Acquire) {
				self.spawn_connect(backend);
			}
		}
	}

	pub fn untrack_backend(&self, name: &str) {
		self.inner.backends.write().expect("backends lock").retain(|b| !b.same_name(name));
		let removed = self.inner.connections.write().expect("connections lock").remove(&name.to_lowercase());
		if let Some(connection) = removed {
			connection.close();
		}
	}

	/// Register a plugin channel; inbound messages on unregistered channels
	/// are dropped.
	pub fn register_channel(&self, channel: impl Into<String>) {
		self.inner.registered_channels.write().expect("channels lock").insert(channel.into());
	}

	pub fn unregister_channel(&self, channel: &str) {
		self.inner.registered_channels.write().expect("channels lock").remove(channel);
	}

	pub fn is_connected(&self, backend_name: &str) -> bool {
		self.inner
			.connections
			.read()
			.expect("connections lock")
			.get(&backend_name.to_lowercase())
			.map(|c| c.is_active())
			.unwrap_or(false)
	}

	pub fn connection_state(&self, backend_name: &str) -> ControlState {
		self.inner
			.connections
			.read()
			.expect("connections lock")
			.get(&backend_name.to_lowercase())
			.map(|c| c.state())
			.unwrap_or(ControlState::Disconnected)
	}

	/// Send a plugin message to one backend. Returns false when no ACTIVE
	/// connection exists; individual sends are never retried.
	pub fn send(&self, backend_name: &str, channel: &str, payload: Bytes) -> bool {
		let connection = {
			let connections = self.inner.connections.read().expect("connections lock");
			connections.get(&backend_name.to_lowercase()).cloned()
		};

		match connection {
			Some(connection) => {
				let sent = connection.send(&PluginMessage::new(channel, payload));
				if !sent {
					debug!(backend = %backend_name, channel, "no active control connection");
				}
				sent
			}
			None => {
				debug!(backend = %backend_name, channel, "no control connection");
				false
			}
		}
	}

	/// Send a plugin message to every ACTIVE backend; returns how many took it.
	pub fn broadcast(&self, channel: &str, payload: Bytes) -> usize {
		let connections: Vec<Arc<ControlConnection>> = {
			let map = self.inner.connections.read().expect("connections lock");
			map.values().cloned().collect()
		};

		connections
			.iter()
			.filter(|c| c.send(&PluginMessage::new(channel, payload.clone())))
			.count()
	}

	fn check_and_reconnect(&self) {
		if !self.inner.running.load(Ordering::Acquire) {
			return;
		}

		let backends: Vec<BackendServer> = self.inner.backends.read().expect("backends lock").clone();
		for backend in backends {
			let key = backend.name.to_lowercase();
			let needs_connect = {
				let connections = self.inner.connections.read().expect("connections lock");
				connections.get(&key).map(|c| !c.is_active()).unwrap_or(true)
			};

			if needs_connect {
				debug!(backend = %backend.name, "reconnecting control connection");
				metrics::counter!("numdrassl_control_reconnects_total").increment(1);
				self.spawn_connect(backend);
			}
		}
	}

	fn spawn_connect(&self, backend: BackendServer) {
		let key = backend.name.to_lowercase();
		let connection = Arc::new(ControlConnection::new(backend.clone()));
		{
			let mut connections = self.inner.connections.write().expect("connections lock");
			if let Some(existing) = connections.get(&key) {
				if existing.is_active() {
					return;
				}
				existing.close();
			}
			connections.insert(key, Arc::clone(&connection));
		}

		let manager = self.clone();
		tokio::spawn(async move {
			if let Err(e) = manager.run_connection(Arc::clone(&connection)).await {
				debug!(backend = %connection.backend.name, error = %e, "control connection failed");
			}
			connection.set_state(ControlState::Disconnected);
		});
	}

	async fn run_connection(&self, connection: Arc<ControlConnection>) -> anyhow::Result<()> {
		let backend = connection.backend.clone();
		connection.set_state(ControlState::Connecting);

		let addr = tokio::net::lookup_host((backend.host.as_str(), backend.port))
			.await?
			.next()
			.ok_or_else(|| anyhow::anyhow!("no address for {}:{}", backend.host, backend.port))?;

		let quic = tokio::time::timeout(CONNECT_TIMEOUT, async {
			let connecting = self.inner.endpoint.connect(addr, backend.sni_name())?;
			Ok::<_, anyhow::Error>(connecting.await?)
		})
		.await
		.map_err(|_| anyhow::anyhow!("control dial timed out"))??;

		info!(backend = %backend.name, "control QUIC connection established");

		let (send, mut recv) = quic.open_bi().await?;
		connection.set_state(ControlState::Handshaking);

		let tx = spawn_stream_writer(send, 0, "control");
		*connection.link.lock().expect("link lock") = Some((quic.clone(), tx.clone()));

		// Authenticated handshake: a control-marker referral wrapped in a
		// plugin-message envelope.
		let blob = referral::sign_control_referral(&backend.name, unix_ms_now(), self.inner.secret.as_bytes());
		let handshake = PluginMessage::new(channels::CONTROL_HANDSHAKE, blob);
		if tx.send(handshake.encode()?).is_err() {
			connection.close();
			return Err(anyhow::anyhow!("control stream writer gone before handshake"));
		}

		connection.set_state(ControlState::Active);
		info!(backend = %backend.name, "control connection active");

		// Inbound plugin messages.
		let mut buf = BytesMut::with_capacity(8 * 1024);
		let mut tmp = [0u8; 4096];
		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => break,
				Err(e) => {
					debug!(backend = %backend.name, error = %e, "control stream read failed");
					break;
				}
			};
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match PluginMessage::try_decode(&mut buf) {
					Ok(Some(message)) => self.handle_incoming(&backend, message).await,
					Ok(None) => break,
					Err(e) => {
						warn!(backend = %backend.name, error = %e, "malformed control payload, dropping connection");
						connection.close();
						return Ok(());
					}
				}
			}
		}

		info!(backend = %backend.name, "control connection closed");
		connection.close();
		Ok(())
	}

	async fn handle_incoming(&self, backend: &BackendServer, message: PluginMessage) {
		let registered = self
			.inner
			.registered_channels
			.read()
			.expect("channels lock")
			.contains(&message.channel);

		if !registered {
			debug!(backend = %backend.name, channel = %message.channel, "dropping plugin message on unregistered channel");
			return;
		}

		let server = RegisteredServer {
			name: backend.name.clone(),
			host: backend.host.clone(),
			port: backend.port,
			is_default: backend.default_server,
			owner_proxy_id: None,
		};

		self.inner.hooks.plugin_message(&message.channel, &server, &message.payload).await;
	}
}
