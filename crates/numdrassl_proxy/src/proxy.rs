#![forbid(unsafe_code)]

//! The proxy root value and public facade.
//!
//! Everything the core owns hangs off one `Proxy`, passed explicitly; there
//! are no ambient singletons. The facade is the thin aggregation surface the
//! extension layer programs against.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use numdrassl_protocol::cluster::{HeartbeatMessage, ServerListKind};
use numdrassl_protocol::secret::ProxySecret;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::SessionServiceClient;
use crate::backend::control::BackendControlManager;
use crate::backend::dialer;
use crate::cluster::registry::ProxyInfo;
use crate::cluster::server_list::RegisteredServer;
use crate::cluster::{ClusterManager, resolve_proxy_id};
use crate::config::{BackendServer, ProxyConfig};
use crate::hooks::ProxyHooks;
use crate::listener;
use crate::quic::{self, TlsMaterial};
use crate::session::store::SessionStore;
use crate::session::ProxySession;
use crate::transfer::{self, TransferResult};

use std::collections::HashMap;

struct ProxyInner {
	config: ProxyConfig,
	secret: ProxySecret,
	hooks: Arc<dyn ProxyHooks>,
	store: Arc<SessionStore>,
	session_service: SessionServiceClient,
	server_endpoint: quinn::Endpoint,
	dial_endpoint: quinn::Endpoint,
	cluster: ClusterManager,
	control: BackendControlManager,
	local_servers: RwLock<HashMap<String, RegisteredServer>>,
	started_at: Instant,
	next_session_id: AtomicU64,
	tls_fingerprint: String,
}

/// Cheaply cloneable handle to the running proxy.
#[derive(Clone)]
pub struct Proxy {
	inner: Arc<ProxyInner>,
}

impl Proxy {
	/// Build every component and bind the endpoints. `run` starts accepting.
	pub async fn start(config: ProxyConfig, hooks: Arc<dyn ProxyHooks>) -> anyhow::Result<Proxy> {
		let secret = ProxySecret::resolve(config.proxy_secret.as_deref());

		let tls = TlsMaterial::load_or_generate(&config.certificate_path, &config.private_key_path)?;
		info!(fingerprint = %tls.fingerprint(), "backends must pin this certificate fingerprint");

		let idle_timeout = Duration::from_secs(config.connection_timeout_seconds);
		let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
			.parse()
			.with_context(|| format!("invalid bind address {}:{}", config.bind_address, config.bind_port))?;

		let server_endpoint = quic::server_endpoint(bind_addr, &tls, idle_timeout)?;
		let dial_endpoint = quic::client_endpoint(&tls, idle_timeout, false)?;
		let control_endpoint = quic::client_endpoint(&tls, Duration::from_secs(60), true)?;

		let session_service = SessionServiceClient::new(
			config.session_service.base_url.clone(),
			Duration::from_secs(config.session_service.timeout_seconds),
		)
		.context("build session service client")?;

		let store = Arc::new(SessionStore::new());
		let started_at = Instant::now();

		let local_proxy_id = resolve_proxy_id(&config);
		let heartbeat_source: crate::cluster::heartbeat::HeartbeatSource = {
			let proxy_id = local_proxy_id.clone();
			let region = config.cluster.region.clone();
			let host = config.advertised_host();
			let port = config.advertised_port();
			let max_players = config.max_connections as u32;
			let store = Arc::clone(&store);
			Arc::new(move |shutting_down| HeartbeatMessage {
				source_proxy_id: proxy_id.clone(),
				region: region.clone(),
				host: host.clone(),
				port,
				player_count: store.count() as u32,
				max_players,
				uptime_ms: started_at.elapsed().as_millis() as u64,
				version: env!("CARGO_PKG_VERSION").to_string(),
				shutting_down,
			})
		};

		let cluster = ClusterManager::start(local_proxy_id, &config, heartbeat_source).await;

		let control = BackendControlManager::new(control_endpoint, secret.clone(), Arc::clone(&hooks), config.backends.clone());

		let mut local_servers = HashMap::new();
		for backend in &config.backends {
			local_servers.insert(
				backend.name.to_lowercase(),
				RegisteredServer {
					name: backend.name.clone(),
					host: backend.host.clone(),
					port: backend.port,
					is_default: backend.default_server,
					owner_proxy_id: None,
				},
			);
		}

		let fingerprint = tls.fingerprint().to_string();
		let proxy = Proxy {
			inner: Arc::new(ProxyInner {
				config,
				secret,
				hooks,
				store,
				session_service,
				server_endpoint,
				dial_endpoint,
				cluster,
				control,
				local_servers: RwLock::new(local_servers),
				started_at,
				next_session_id: AtomicU64::new(0),
				tls_fingerprint: fingerprint,
			}),
		};

		proxy.inner.control.start();

		info!(
			bind = %bind_addr,
			backends = proxy.inner.config.backends.len(),
			cluster = proxy.is_cluster_mode(),
			"proxy started"
		);
		for backend in &proxy.inner.config.backends {
			info!(
				"  backend {} -> {}:{}{}",
				backend.name,
				backend.host,
				backend.port,
				if backend.default_server { " (default)" } else { "" }
			);
		}

		Ok(proxy)
	}

	/// Accept client connections; returns when the endpoint closes.
	pub async fn run(&self) -> anyhow::Result<()> {
		listener::run_listener(self.clone()).await
	}

	pub async fn shutdown(&self) {
		info!("shutting down proxy");
		self.inner.store.close_all("Server shutting down");
		self.inner.control.stop();
		self.inner.cluster.shutdown().await;
		self.inner.server_endpoint.close(0u32.into(), b"shutdown");
		self.inner.dial_endpoint.close(0u32.into(), b"shutdown");
		info!("proxy stopped");
	}

	// ---- component access --------------------------------------------------

	pub fn config(&self) -> &ProxyConfig {
		&self.inner.config
	}

	pub fn secret(&self) -> &ProxySecret {
		&self.inner.secret
	}

	pub fn hooks(&self) -> &Arc<dyn ProxyHooks> {
		&self.inner.hooks
	}

	pub fn store(&self) -> &SessionStore {
		&self.inner.store
	}

	pub fn session_service(&self) -> &SessionServiceClient {
		&self.inner.session_service
	}

	pub fn server_endpoint(&self) -> &quinn::Endpoint {
		&self.inner.server_endpoint
	}

	pub fn dial_endpoint(&self) -> &quinn::Endpoint {
		&self.inner.dial_endpoint
	}

	pub fn cluster(&self) -> &ClusterManager {
		&self.inner.cluster
	}

	pub fn control(&self) -> &BackendControlManager {
		&self.inner.control
	}

	pub fn certificate_fingerprint(&self) -> &str {
		&self.inner.tls_fingerprint
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		Ok(self.inner.server_endpoint.local_addr()?)
	}

	pub fn uptime(&self) -> Duration {
		self.inner.started_at.elapsed()
	}

	pub(crate) fn next_session_id(&self) -> u64 {
		self.inner.next_session_id.fetch_add(1, Ordering::AcqRel) + 1
	}

	// ---- player facade -----------------------------------------------------

	pub fn all_players(&self) -> Vec<Arc<ProxySession>> {
		self.inner.store.all()
	}

	pub fn player_count(&self) -> usize {
		self.inner.store.count()
	}

	pub fn get_player_by_uuid(&self, uuid: Uuid) -> Option<Arc<ProxySession>> {
		self.inner.store.get_by_uuid(uuid)
	}

	pub fn get_player_by_name(&self, username: &str) -> Option<Arc<ProxySession>> {
		self.inner.store.get_by_name(username)
	}

	/// Sessions currently attached to the named local server.
	pub fn players_on_server(&self, server_name: &str) -> Vec<Arc<ProxySession>> {
		self.inner.store.players_on_backend(server_name)
	}

	pub fn global_player_count(&self) -> u32 {
		if self.is_cluster_mode() {
			self.inner.cluster.global_player_count()
		} else {
			self.player_count() as u32
		}
	}

	/// Which proxy hosts a player. Only local sessions are checked; there is
	/// no cross-proxy location store.
	pub fn find_player_proxy(&self, uuid: Uuid) -> Option<String> {
		if self.inner.store.get_by_uuid(uuid).is_some() {
			return Some(self.inner.cluster.local_proxy_id().to_string());
		}
		None
	}

	pub fn is_player_online(&self, uuid: Uuid) -> bool {
		self.find_player_proxy(uuid).is_some()
	}

	// ---- cluster facade ----------------------------------------------------

	pub fn is_cluster_mode(&self) -> bool {
		self.inner.cluster.is_cluster_mode()
	}

	pub fn local_proxy_id(&self) -> &str {
		self.inner.cluster.local_proxy_id()
	}

	pub fn online_proxies(&self) -> Vec<ProxyInfo> {
		self.inner.cluster.online_proxies()
	}

	pub fn least_loaded_proxy(&self) -> Option<ProxyInfo> {
		self.inner.cluster.least_loaded_proxy()
	}

	pub fn proxies_in_region(&self, region: &str) -> Vec<ProxyInfo> {
		self.inner.cluster.proxies_in_region(region)
	}

	// ---- server facade -----------------------------------------------------

	/// Merged server view; local entries shadow remote ones with the same
	/// case-insensitive name.
	pub fn all_servers(&self) -> Vec<RegisteredServer> {
		let local = self.inner.local_servers.read().expect("servers lock");
		let mut merged: Vec<RegisteredServer> = local.values().cloned().collect();

		for remote in self.inner.cluster.server_list().all_remote() {
			if !local.contains_key(&remote.name.to_lowercase()) {
				merged.push(remote);
			}
		}
		merged
	}

	pub fn get_server(&self, name: &str) -> Option<RegisteredServer> {
		let key = name.to_lowercase();
		if let Some(server) = self.inner.local_servers.read().expect("servers lock").get(&key) {
			return Some(server.clone());
		}
		self.inner.cluster.server_list().get_remote(name)
	}

	/// Register (or replace) a local server and announce it to the cluster.
	pub async fn register_server(&self, name: &str, host: &str, port: u16, is_default: bool) -> RegisteredServer {
		let server = RegisteredServer {
			name: name.to_string(),
			host: host.to_string(),
			port,
			is_default,
			owner_proxy_id: None,
		};

		let replaced = self
			.inner
			.local_servers
			.write()
			.expect("servers lock")
			.insert(name.to_lowercase(), server.clone())
			.is_some();
		if replaced {
			info!(server = name, "replaced local server registration");
		} else {
			info!(server = name, host, port, "registered local server");
		}

		self.inner.control.track_backend(BackendServer {
			name: name.to_string(),
			host: host.to_string(),
			port,
			default_server: is_default,
			hostname: None,
		});

		self.inner
			.cluster
			.publish_server_list(ServerListKind::Register, name, Some(host.to_string()), Some(port), is_default)
			.await;

		server
	}

	/// Remove a local server and announce the removal.
	pub async fn unregister_server(&self, name: &str) -> bool {
		let removed = self.inner.local_servers.write().expect("servers lock").remove(&name.to_lowercase()).is_some();
		if !removed {
			return false;
		}

		info!(server = name, "unregistered local server");
		self.inner.control.untrack_backend(name);
		self.inner
			.cluster
			.publish_server_list(ServerListKind::Unregister, name, None, None, false)
			.await;
		true
	}

	/// A dialable descriptor for a named backend, local registrations first.
	pub fn find_backend(&self, name: &str) -> Option<BackendServer> {
		if let Some(configured) = self.inner.config.backend_by_name(name) {
			return Some(configured.clone());
		}

		let local = self.inner.local_servers.read().expect("servers lock");
		local.get(&name.to_lowercase()).map(|server| BackendServer {
			name: server.name.clone(),
			host: server.host.clone(),
			port: server.port,
			default_server: server.is_default,
			hostname: None,
		})
	}

	// ---- transfer facade ---------------------------------------------------

	/// In-session switch to a named backend.
	pub async fn switch_player_to(&self, session: &Arc<ProxySession>, backend_name: &str) -> bool {
		let Some(backend) = self.find_backend(backend_name) else {
			warn!(session = session.id(), backend = backend_name, "unknown backend server");
			return false;
		};
		dialer::switch_backend(self, session, backend).await
	}

	/// In-session switch to a backend by address, fabricating a temporary
	/// descriptor when no configured backend matches.
	pub async fn transfer_by_address(&self, session: &Arc<ProxySession>, host: &str, port: u16) -> bool {
		let backend = self
			.inner
			.config
			.backends
			.iter()
			.find(|b| b.host.eq_ignore_ascii_case(host) && b.port == port)
			.cloned()
			.unwrap_or_else(|| BackendServer {
				name: format!("temp-{host}-{port}"),
				host: host.to_string(),
				port,
				default_server: false,
				hostname: None,
			});

		dialer::switch_backend(self, session, backend).await
	}

	/// Disconnect/reconnect transfer via a ClientReferral frame.
	pub fn transfer_by_referral(&self, session: &Arc<ProxySession>, backend_name: &str) -> TransferResult {
		match self.find_backend(backend_name) {
			Some(backend) => transfer::transfer_by_referral(self, session, &backend),
			None => TransferResult {
				success: false,
				message: format!("Unknown backend server: {backend_name}"),
			},
		}
	}

	// ---- plugin messaging facade -------------------------------------------

	pub fn send_plugin_message(&self, backend_name: &str, channel: &str, payload: Bytes) -> bool {
		self.inner.control.send(backend_name, channel, payload)
	}

	pub fn broadcast_plugin_message(&self, channel: &str, payload: Bytes) -> usize {
		self.inner.control.broadcast(channel, payload)
	}

	pub fn register_plugin_channel(&self, channel: &str) {
		self.inner.control.register_channel(channel);
	}
}
