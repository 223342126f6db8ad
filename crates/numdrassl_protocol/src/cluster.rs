#![forbid(unsafe_code)]

//! Messages exchanged between proxies over the cluster pub/sub substrate.
//!
//! Broker payloads are JSON; the `messageType` tag selects the concrete
//! record on receive. The loopback messaging implementation carries the same
//! values without serializing.

use serde::{Deserialize, Serialize};

/// Stable channel identifiers.
pub mod channels {
	pub const HEARTBEAT: &str = "numdrassl:heartbeat";
	pub const SERVER_LIST: &str = "numdrassl:server-list";
	pub const PLAYER_COUNT: &str = "numdrassl:player-count";
	pub const CHAT: &str = "numdrassl:chat";
	pub const TRANSFER: &str = "numdrassl:transfer";
	pub const PLUGIN: &str = "numdrassl:plugin";
	pub const BROADCAST: &str = "numdrassl:broadcast";

	/// Channel used for the control-stream handshake envelope (not a pub/sub
	/// channel; carried inside a plugin-message envelope over QUIC).
	pub const CONTROL_HANDSHAKE: &str = "numdrassl:control_handshake";

	/// Every pub/sub channel a proxy participates in.
	pub const ALL: &[&str] = &[HEARTBEAT, SERVER_LIST, PLAYER_COUNT, CHAT, TRANSFER, PLUGIN, BROADCAST];
}

/// Periodic liveness and status announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
	pub source_proxy_id: String,
	pub region: String,
	pub host: String,
	pub port: u16,
	pub player_count: u32,
	pub max_players: u32,
	pub uptime_ms: u64,
	pub version: String,
	#[serde(default)]
	pub shutting_down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerListKind {
	Register,
	Unregister,
	Sync,
}

/// Backend server registration replicated across proxies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerListMessage {
	pub source_proxy_id: String,
	pub timestamp_ms: i64,
	pub kind: ServerListKind,
	pub server_name: String,
	#[serde(default)]
	pub host: Option<String>,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default)]
	pub is_default: bool,
}

impl ServerListMessage {
	/// REGISTER and SYNC require an address; UNREGISTER ignores it.
	pub fn is_valid(&self) -> bool {
		if self.server_name.is_empty() {
			return false;
		}
		match self.kind {
			ServerListKind::Register | ServerListKind::Sync => {
				matches!(&self.host, Some(h) if !h.is_empty()) && matches!(self.port, Some(p) if p >= 1)
			}
			ServerListKind::Unregister => true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCountMessage {
	pub source_proxy_id: String,
	pub player_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcastMessage {
	pub source_proxy_id: String,
	pub sender: String,
	pub message: String,
}

/// Request that the proxy currently hosting a player move them elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestMessage {
	pub source_proxy_id: String,
	pub player_uuid: uuid::Uuid,
	pub target_server: String,
}

/// Cluster-wide plugin payload relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginBroadcastMessage {
	pub source_proxy_id: String,
	pub plugin_id: String,
	pub channel: String,
	/// Base64-encoded payload.
	pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
	pub source_proxy_id: String,
	pub message: String,
}

/// Tagged union of every cluster payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "snake_case")]
pub enum ClusterMessage {
	Heartbeat(HeartbeatMessage),
	ServerList(ServerListMessage),
	PlayerCount(PlayerCountMessage),
	Chat(ChatBroadcastMessage),
	Transfer(TransferRequestMessage),
	Plugin(PluginBroadcastMessage),
	Broadcast(BroadcastMessage),
}

impl From<HeartbeatMessage> for ClusterMessage {
	fn from(m: HeartbeatMessage) -> ClusterMessage {
		ClusterMessage::Heartbeat(m)
	}
}

impl From<ServerListMessage> for ClusterMessage {
	fn from(m: ServerListMessage) -> ClusterMessage {
		ClusterMessage::ServerList(m)
	}
}

impl From<PlayerCountMessage> for ClusterMessage {
	fn from(m: PlayerCountMessage) -> ClusterMessage {
		ClusterMessage::PlayerCount(m)
	}
}

/// Discriminator used for subscription type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
	Heartbeat,
	ServerList,
	PlayerCount,
	Chat,
	Transfer,
	Plugin,
	Broadcast,
}

impl ClusterMessage {
	pub fn kind(&self) -> MessageKind {
		match self {
			ClusterMessage::Heartbeat(_) => MessageKind::Heartbeat,
			ClusterMessage::ServerList(_) => MessageKind::ServerList,
			ClusterMessage::PlayerCount(_) => MessageKind::PlayerCount,
			ClusterMessage::Chat(_) => MessageKind::Chat,
			ClusterMessage::Transfer(_) => MessageKind::Transfer,
			ClusterMessage::Plugin(_) => MessageKind::Plugin,
			ClusterMessage::Broadcast(_) => MessageKind::Broadcast,
		}
	}

	pub fn source_proxy_id(&self) -> &str {
		match self {
			ClusterMessage::Heartbeat(m) => &m.source_proxy_id,
			ClusterMessage::ServerList(m) => &m.source_proxy_id,
			ClusterMessage::PlayerCount(m) => &m.source_proxy_id,
			ClusterMessage::Chat(m) => &m.source_proxy_id,
			ClusterMessage::Transfer(m) => &m.source_proxy_id,
			ClusterMessage::Plugin(m) => &m.source_proxy_id,
			ClusterMessage::Broadcast(m) => &m.source_proxy_id,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn samples() -> Vec<ClusterMessage> {
		vec![
			ClusterMessage::Heartbeat(HeartbeatMessage {
				source_proxy_id: "proxy-1".to_string(),
				region: "eu".to_string(),
				host: "198.51.100.4".to_string(),
				port: 24322,
				player_count: 12,
				max_players: 1000,
				uptime_ms: 60_000,
				version: "0.1.0".to_string(),
				shutting_down: false,
			}),
			ClusterMessage::ServerList(ServerListMessage {
				source_proxy_id: "proxy-1".to_string(),
				timestamp_ms: 1_700_000_000_000,
				kind: ServerListKind::Register,
				server_name: "arena".to_string(),
				host: Some("10.0.0.5".to_string()),
				port: Some(5520),
				is_default: false,
			}),
			ClusterMessage::PlayerCount(PlayerCountMessage {
				source_proxy_id: "proxy-2".to_string(),
				player_count: 3,
			}),
			ClusterMessage::Chat(ChatBroadcastMessage {
				source_proxy_id: "proxy-2".to_string(),
				sender: "Steve".to_string(),
				message: "hi".to_string(),
			}),
			ClusterMessage::Transfer(TransferRequestMessage {
				source_proxy_id: "proxy-2".to_string(),
				player_uuid: uuid::Uuid::from_u128(7),
				target_server: "lobby".to_string(),
			}),
			ClusterMessage::Plugin(PluginBroadcastMessage {
				source_proxy_id: "proxy-1".to_string(),
				plugin_id: "luckperms".to_string(),
				channel: "luckperms:sync".to_string(),
				payload: "AAECAw==".to_string(),
			}),
			ClusterMessage::Broadcast(BroadcastMessage {
				source_proxy_id: "proxy-1".to_string(),
				message: "restart in 5m".to_string(),
			}),
		]
	}

	#[test]
	fn json_roundtrip_every_variant() {
		for msg in samples() {
			let json = serde_json::to_string(&msg).expect("encode");
			assert!(json.contains("\"messageType\""), "missing tag in {json}");
			let back: ClusterMessage = serde_json::from_str(&json).expect("decode");
			assert_eq!(back, msg);
		}
	}

	#[test]
	fn server_list_validation() {
		let mut msg = ServerListMessage {
			source_proxy_id: "p".to_string(),
			timestamp_ms: 0,
			kind: ServerListKind::Register,
			server_name: "arena".to_string(),
			host: Some("10.0.0.5".to_string()),
			port: Some(5520),
			is_default: false,
		};
		assert!(msg.is_valid());

		msg.port = Some(0);
		assert!(!msg.is_valid());

		msg.port = None;
		assert!(!msg.is_valid());

		msg.kind = ServerListKind::Unregister;
		assert!(msg.is_valid());

		msg.kind = ServerListKind::Sync;
		msg.host = None;
		msg.port = Some(5520);
		assert!(!msg.is_valid());
	}

	#[test]
	fn message_tag_matches_channel_naming() {
		let json = serde_json::to_string(&samples()[0]).expect("encode");
		assert!(json.contains("\"messageType\":\"heartbeat\""));
	}
}
