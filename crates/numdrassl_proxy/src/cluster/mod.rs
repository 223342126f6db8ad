#![forbid(unsafe_code)]

//! Cluster coordination: peer registry, heartbeats, and server-list
//! replication over the messaging substrate.

pub mod heartbeat;
pub mod registry;
pub mod server_list;



use std::sync::{Arc, Mutex};
use std::time::Instant;

use numdrassl_protocol::cluster::{ClusterMessage, MessageKind, ServerListKind, ServerListMessage, channels};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::messaging::loopback::LoopbackMessagingService;
use crate::messaging::redis::RedisMessagingService;
use crate::messaging::{MessagingService, SubscribeOptions};
use crate::util::unix_ms_now;

use heartbeat::{HeartbeatPublisher, HeartbeatSource};
use registry::{CLEANUP_INTERVAL, ClusterEvent, HEARTBEAT_TIMEOUT, ProxyInfo, ProxyRegistry};
use server_list::ServerListHandler;

/// Pick the proxy id: configured value, else a generated `proxy-xxxxxxxx`.
pub fn resolve_proxy_id(config: &ProxyConfig) -> String {
	match config.cluster.proxy_id.as_deref() {
		Some(id) if !id.trim().is_empty() => id.trim().to_string(),
		_ => {
			let id = format!("proxy-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
			info!(proxy_id = %id, "generated proxy id");
			id
		}
	}
}

/// Owns the cluster-facing services and the messaging implementation choice.
///
/// When cluster mode is configured and the broker connects, the broker-backed
/// service is used; on failure the proxy logs, falls back to loopback, and
/// reports degraded (single-node) behavior through [`Self::is_cluster_mode`].
pub struct ClusterManager {
	enabled: bool,
	degraded: bool,
	local_proxy_id: String,
	region: String,
	messaging: Arc<dyn MessagingService>,
	registry: Arc<ProxyRegistry>,
	server_list: Arc<ServerListHandler>,
	heartbeat: Option<HeartbeatPublisher>,
	source: HeartbeatSource,
	cleanup_task: Mutex<Option<JoinHandle<()>>>,
	purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
	pub async fn start(local_proxy_id: String, config: &ProxyConfig, source: HeartbeatSource) -> ClusterManager {
		let enabled = config.cluster.enabled;

		let (messaging, degraded): (Arc<dyn MessagingService>, bool) = if enabled {
			match RedisMessagingService::connect(&local_proxy_id, &config.cluster).await {
				Ok(service) => (Arc::new(service), false),
				Err(e) => {
					warn!(error = %e, "message broker unreachable, falling back to loopback; cluster degraded");
					(Arc::new(LoopbackMessagingService::new(local_proxy_id.clone())), true)
				}
			}
		} else {
			(Arc::new(LoopbackMessagingService::new(local_proxy_id.clone())), false)
		};

		let registry = Arc::new(ProxyRegistry::new(local_proxy_id.clone()));
		let server_list = Arc::new(ServerListHandler::new(local_proxy_id.clone()));

		let mut manager = ClusterManager {
			enabled,
			degraded,
			local_proxy_id: local_proxy_id.clone(),
			region: config.cluster.region.clone(),
			messaging,
			registry,
			server_list,
			heartbeat: None,
			source,
			cleanup_task: Mutex::new(None),
			purge_task: Mutex::new(None),
		};

		if enabled {
			manager.start_services();
		} else {
			info!("cluster mode disabled, skipping cluster services");
		}

		manager
	}

	fn start_services(&mut self) {
		// The registry keeps the local proxy's own entry current, so its
		// heartbeat subscription opts into self-delivery.
		let registry = Arc::clone(&self.registry);
		self.messaging.subscribe(
			channels::HEARTBEAT,
			SubscribeOptions {
				include_self: true,
				kind: Some(MessageKind::Heartbeat),
			},
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Heartbeat(hb) = msg {
					registry.handle_heartbeat(hb, Instant::now());
				}
				Ok(())
			}),
		);

		let server_list = Arc::clone(&self.server_list);
		self.messaging.subscribe(
			channels::SERVER_LIST,
			SubscribeOptions::of_kind(MessageKind::ServerList),
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::ServerList(m) = msg {
					server_list.handle_message(m);
				}
				Ok(())
			}),
		);

		let registry = Arc::clone(&self.registry);
		let cleanup = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
			ticker.tick().await; // immediate first tick
			loop {
				ticker.tick().await;
				registry.cleanup_stale(Instant::now(), HEARTBEAT_TIMEOUT);
			}
		});
		*self.cleanup_task.lock().expect("cleanup lock") = Some(cleanup);

		// Departing peers take their servers with them.
		let server_list = Arc::clone(&self.server_list);
		let mut events = self.registry.subscribe_events();
		let purge = tokio::spawn(async move {
			while let Ok(event) = events.recv().await {
				if let ClusterEvent::ProxyLeft { info, .. } = event {
					server_list.remove_proxy_servers(&info.proxy_id);
				}
			}
		});
		*self.purge_task.lock().expect("purge lock") = Some(purge);

		let publisher = HeartbeatPublisher::new(Arc::clone(&self.messaging), Arc::clone(&self.source));
		publisher.start();
		self.heartbeat = Some(publisher);

		info!(proxy_id = %self.local_proxy_id, region = %self.region, "cluster services started");
	}

	pub fn is_cluster_mode(&self) -> bool {
		self.enabled && !self.degraded && self.messaging.is_connected()
	}

	pub fn local_proxy_id(&self) -> &str {
		&self.local_proxy_id
	}

	pub fn region(&self) -> &str {
		&self.region
	}

	pub fn messaging(&self) -> &Arc<dyn MessagingService> {
		&self.messaging
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		&self.registry
	}

	pub fn server_list(&self) -> &Arc<ServerListHandler> {
		&self.server_list
	}

	/// Snapshot of this proxy as peers would see it.
	pub fn local_proxy_info(&self) -> ProxyInfo {
		let hb = (self.source)(false);
		ProxyInfo {
			proxy_id: hb.source_proxy_id,
			region: hb.region,
			host: hb.host,
			port: hb.port,
			player_count: hb.player_count,
			max_players: hb.max_players,
			uptime_ms: hb.uptime_ms,
			version: hb.version,
			last_heartbeat: Instant::now(),
		}
	}

	/// Every known proxy, always including the local one.
	pub fn online_proxies(&self) -> Vec<ProxyInfo> {
		if !self.is_cluster_mode() {
			return vec![self.local_proxy_info()];
		}

		let mut proxies = self.registry.online_proxies();
		if !proxies.iter().any(|p| p.proxy_id == self.local_proxy_id) {
			proxies.push(self.local_proxy_info());
		}
		proxies
	}

	pub fn get_proxy(&self, proxy_id: &str) -> Option<ProxyInfo> {
		if proxy_id == self.local_proxy_id {
			return Some(self.local_proxy_info());
		}
		if !self.is_cluster_mode() {
			return None;
		}
		self.registry.get(proxy_id)
	}

	pub fn proxies_in_region(&self, region: &str) -> Vec<ProxyInfo> {
		self.online_proxies()
			.into_iter()
			.filter(|p| p.region.eq_ignore_ascii_case(region))
			.collect()
	}

	pub fn least_loaded_proxy(&self) -> Option<ProxyInfo> {
		self.online_proxies()
			.into_iter()
			.filter(ProxyInfo::has_capacity)
			.min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
	}

	pub fn least_loaded_proxy_in_region(&self, region: &str) -> Option<ProxyInfo> {
		self.proxies_in_region(region)
			.into_iter()
			.filter(ProxyInfo::has_capacity)
			.min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
	}

	pub fn global_player_count(&self) -> u32 {
		if !self.is_cluster_mode() {
			return (self.source)(false).player_count;
		}

		let mut count = self.registry.global_player_count();
		if self.registry.get(&self.local_proxy_id).is_none() {
			count += (self.source)(false).player_count;
		}
		count
	}

	pub fn proxy_count(&self) -> usize {
		if !self.is_cluster_mode() {
			return 1;
		}
		self.registry.proxy_count().max(1)
	}

	/// Publish a server-list change to peers. A no-op error when degraded.
	pub async fn publish_server_list(&self, kind: ServerListKind, name: &str, host: Option<String>, port: Option<u16>, is_default: bool) {
		let message = ServerListMessage {
			source_proxy_id: self.local_proxy_id.clone(),
			timestamp_ms: unix_ms_now(),
			kind,
			server_name: name.to_string(),
			host,
			port,
			is_default,
		};

		if let Err(e) = self.messaging.publish(channels::SERVER_LIST, message.into()).await {
			warn!(server = name, error = %e, "failed to publish server-list update");
		}
	}

	pub async fn shutdown(&self) {
		if let Some(publisher) = &self.heartbeat {
			publisher.stop().await;
		}
		if let Some(task) = self.cleanup_task.lock().expect("cleanup lock").take() {
			task.abort();
		}
		if let Some(task) = self.purge_task.lock().expect("purge lock").take() {
			task.abort();
		}
		self.messaging.shutdown().await;
		info!("cluster services stopped");
	}
}
