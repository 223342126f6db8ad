#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use numdrassl_protocol::cluster::HeartbeatMessage;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// How long a peer may stay silent before it is considered stale.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cleanup tick interval.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Known state of one proxy in the cluster.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
	pub proxy_id: String,
	pub region: String,
	pub host: String,
	pub port: u16,
	pub player_count: u32,
	pub max_players: u32,
	pub uptime_ms: u64,
	pub version: String,
	pub last_heartbeat: Instant,
}

impl ProxyInfo {
	pub fn has_capacity(&self) -> bool {
		self.player_count < self.max_players
	}

	pub fn load_factor(&self) -> f64 {
		if self.max_players == 0 {
			return 1.0;
		}
		f64::from(self.player_count) / f64::from(self.max_players)
	}

	pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
		now.duration_since(self.last_heartbeat) > timeout
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
	Graceful,
	HeartbeatTimeout,
}

/// Membership changes observed by the registry.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
	ProxyJoined(ProxyInfo),
	ProxyLeft {
		info: ProxyInfo,
		reason: LeaveReason,
	},
}

/// Tracks online proxies from heartbeat traffic.
///
/// Entries are last-writer-wins by arrival time. The cleanup tick evicts
/// peers whose last heartbeat is older than [`HEARTBEAT_TIMEOUT`]; the local
/// proxy's own entry is never evicted.
pub struct ProxyRegistry {
	local_proxy_id: String,
	proxies: RwLock<HashMap<String, ProxyInfo>>,
	events: broadcast::Sender<ClusterEvent>,
}

impl ProxyRegistry {
	pub fn new(local_proxy_id: impl Into<String>) -> ProxyRegistry {
		let (events, _) = broadcast::channel(64);
		ProxyRegistry {
			local_proxy_id: local_proxy_id.into(),
			proxies: RwLock::new(HashMap::new()),
			events,
		}
	}

	pub fn local_proxy_id(&self) -> &str {
		&self.local_proxy_id
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
		self.events.subscribe()
	}

	/// Apply one inbound heartbeat.
	pub fn handle_heartbeat(&self, heartbeat: &HeartbeatMessage, now: Instant) {
		let proxy_id = heartbeat.source_proxy_id.clone();

		if heartbeat.shutting_down {
			self.remove(&proxy_id, LeaveReason::Graceful);
			return;
		}

		let info = ProxyInfo {
			proxy_id: proxy_id.clone(),
			region: heartbeat.region.clone(),
			host: heartbeat.host.clone(),
			port: heartbeat.port,
			player_count: heartbeat.player_count,
			max_players: heartbeat.max_players,
			uptime_ms: heartbeat.uptime_ms,
			version: heartbeat.version.clone(),
			last_heartbeat: now,
		};

		let is_new = {
			let mut proxies = self.proxies.write().expect("registry lock");
			proxies.insert(proxy_id.clone(), info.clone()).is_none()
		};

		if is_new && proxy_id != self.local_proxy_id {
			info!(
				proxy = %proxy_id,
				region = %heartbeat.region,
				players = heartbeat.player_count,
				"proxy joined cluster"
			);
			let _ = self.events.send(ClusterEvent::ProxyJoined(info));
		}
	}

	/// Remove a proxy, emitting a leave event when it was present.
	pub fn remove(&self, proxy_id: &str, reason: LeaveReason) {
		let removed = self.proxies.write().expect("registry lock").remove(proxy_id);
		if let Some(info) = removed {
			info!(proxy = %proxy_id, ?reason, "proxy left cluster");
			let _ = self.events.send(ClusterEvent::ProxyLeft { info, reason });
		}
	}

	/// Evict peers whose heartbeat is older than `timeout`. The local entry
	/// survives regardless of age.
	pub fn cleanup_stale(&self, now: Instant, timeout: Duration) {
		let stale: Vec<ProxyInfo> = {
			let mut proxies = self.proxies.write().expect("registry lock");
			let stale_ids: Vec<String> = proxies
				.values()
				.filter(|info| info.proxy_id != self.local_proxy_id && info.is_stale(now, timeout))
				.map(|info| info.proxy_id.clone())
				.collect();
			stale_ids.into_iter().filter_map(|id| proxies.remove(&id)).collect()
		};

		for info in stale {
			warn!(
				proxy = %info.proxy_id,
				since_ms = now.duration_since(info.last_heartbeat).as_millis() as u64,
				"proxy heartbeat timeout"
			);
			let _ = self.events.send(ClusterEvent::ProxyLeft {
				info,
				reason: LeaveReason::HeartbeatTimeout,
			});
		}
	}

	pub fn get(&self, proxy_id: &str) -> Option<ProxyInfo> {
		self.proxies.read().expect("registry lock").get(proxy_id).cloned()
	}

	pub fn online_proxies(&self) -> Vec<ProxyInfo> {
		self.proxies.read().expect("registry lock").values().cloned().collect()
	}

	pub fn proxy_count(&self) -> usize {
		self.proxies.read().expect("registry lock").len()
	}

	pub fn global_player_count(&self) -> u32 {
		self.proxies.read().expect("registry lock").values().map(|p| p.player_count).sum()
	}
}
