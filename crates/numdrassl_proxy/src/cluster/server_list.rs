#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use numdrassl_protocol::cluster::{ServerListKind, ServerListMessage};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Public view of a backend server: a descriptor plus ownership.
///
/// `owner_proxy_id` of `None` marks a local entry; local entries shadow
/// remote entries with the same case-insensitive name when views merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredServer {
	pub name: String,
	pub host: String,
	pub port: u16,
	pub is_default: bool,
	pub owner_proxy_id: Option<String>,
}

impl RegisteredServer {
	pub fn is_local(&self) -> bool {
		self.owner_proxy_id.is_none()
	}
}

#[derive(Debug, Clone)]
pub enum ServerListEvent {
	ServerAdded {
		server: RegisteredServer,
	},
	ServerRemoved {
		server_name: String,
		proxy_id: String,
	},
}

/// Replicates backend-server registrations across proxies.
///
/// Remote servers are tracked per owning proxy so a departing peer's entries
/// can be purged in one sweep, and so unregistration messages from proxy P
/// can only ever remove entries owned by P.
pub struct ServerListHandler {
	local_proxy_id: String,
	remote_by_proxy: RwLock<HashMap<String, HashMap<String, RegisteredServer>>>,
	events: broadcast::Sender<ServerListEvent>,
}

impl ServerListHandler {
	pub fn new(local_proxy_id: impl Into<String>) -> ServerListHandler {
		let (events, _) = broadcast::channel(64);
		ServerListHandler {
			local_proxy_id: local_proxy_id.into(),
			remote_by_proxy: RwLock::new(HashMap::new()),
			events,
		}
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<ServerListEvent> {
		self.events.subscribe()
	}

	/// Apply one inbound server-list message.
	pub fn handle_message(&self, message: &ServerListMessage) {
		if message.source_proxy_id == self.local_proxy_id {
			return;
		}
		if !message.is_valid() {
			warn!(
				proxy = %message.source_proxy_id,
				server = %message.server_name,
				kind = ?message.kind,
				"ignoring invalid server-list message"
			);
			return;
		}

		match message.kind {
			// SYNC carries the same semantics as REGISTER.
			ServerListKind::Register | ServerListKind::Sync => self.upsert(message),
			ServerListKind::Unregister => self.remove(message),
		}
	}

	fn upsert(&self, message: &ServerListMessage) {
		let proxy_id = message.source_proxy_id.clone();
		let key = message.server_name.to_lowercase();

		let server = RegisteredServer {
			name: message.server_name.clone(),
			host: message.host.clone().unwrap_or_default(),
			port: message.port.unwrap_or_default(),
			is_default: message.is_default,
			owner_proxy_id: Some(proxy_id.clone()),
		};

		{
			let mut remote = self.remote_by_proxy.write().expect("server list lock");
			remote.entry(proxy_id.clone()).or_default().insert(key.clone(), server.clone());
		}

		debug!(proxy = %proxy_id, server = %key, "registered remote server");
		let _ = self.events.send(ServerListEvent::ServerAdded { server });
	}

	fn remove(&self, message: &ServerListMessage) {
		let proxy_id = &message.source_proxy_id;
		let key = message.server_name.to_lowercase();

		let removed = {
			let mut remote = self.remote_by_proxy.write().expect("server list lock");
			let Some(servers) = remote.get_mut(proxy_id) else {
				return;
			};
			let removed = servers.remove(&key).is_some();
			if servers.is_empty() {
				remote.remove(proxy_id);
			}
			removed
		};

		if removed {
			debug!(proxy = %proxy_id, server = %key, "unregistered remote server");
			let _ = self.events.send(ServerListEvent::ServerRemoved {
				server_name: key,
				proxy_id: proxy_id.clone(),
			});
		}
	}

	/// Drop every server owned by a departing proxy.
	pub fn remove_proxy_servers(&self, proxy_id: &str) {
		let removed = self.remote_by_proxy.write().expect("server list lock").remove(proxy_id);
		let Some(servers) = removed else {
			return;
		};

		debug!(proxy = %proxy_id, count = servers.len(), "purging servers of departed proxy");
		for name in servers.into_keys() {
			let _ = self.events.send(ServerListEvent::ServerRemoved {
				server_name: name,
				proxy_id: proxy_id.to_string(),
			});
		}
	}

	pub fn get_remote(&self, name: &str) -> Option<RegisteredServer> {
		let key = name.to_lowercase();
		let remote = self.remote_by_proxy.read().expect("server list lock");
		remote.values().find_map(|servers| servers.get(&key).cloned())
	}

	pub fn all_remote(&self) -> Vec<RegisteredServer> {
		let remote = self.remote_by_proxy.read().expect("server list lock");
		remote.values().flat_map(|servers| servers.values().cloned()).collect()
	}

	/// Which proxy owns a remote server with this name.
	pub fn find_proxy_for_server(&self, name: &str) -> Option<String> {
		let key = name.to_lowercase();
		let remote = self.remote_by_proxy.read().expect("server list lock");
		remote
			.iter()
			.find(|(_, servers)| servers.contains_key(&key))
			.map(|(proxy_id, _)| proxy_id.clone())
	}
}
