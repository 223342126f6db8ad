#![forbid(unsafe_code)]

//! Broker-backed messaging over Redis pub/sub.
//!
//! Two connections, mirroring the usual pub/sub split: one dedicated
//! subscriber connection driving the listener task, one multiplexed
//! connection for publishes. Reconnection is the substrate's concern; when
//! the broker drops, outstanding publishes fail fast and the service reports
//! disconnected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use numdrassl_protocol::cluster::{ClusterMessage, channels};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MessageHandler, MessagingError, MessagingService, SubscribeOptions, SubscriptionId, SubscriptionTable};
use crate::config::ClusterConfig;

pub struct RedisMessagingService {
	table: Arc<SubscriptionTable>,
	publish_conn: redis::aio::MultiplexedConnection,
	connected: Arc<AtomicBool>,
	listener: JoinHandle<()>,
}

impl RedisMessagingService {
	/// Connect to the broker and subscribe to every system channel.
	pub async fn connect(local_proxy_id: &str, config: &ClusterConfig) -> Result<RedisMessagingService, MessagingError> {
		let url = redis_url(config);
		info!(host = %config.redis_host, port = config.redis_port, "connecting to message broker");

		let client = redis::Client::open(url).map_err(|e| MessagingError::Broker(e.to_string()))?;
		let publish_conn = client
			.get_multiplexed_async_connection()
			.await
			.map_err(|e| MessagingError::Broker(e.to_string()))?;

		let mut pubsub = client.get_async_pubsub().await.map_err(|e| MessagingError::Broker(e.to_string()))?;
		for channel in channels::ALL {
			pubsub
				.subscribe(*channel)
				.await
				.map_err(|e| MessagingError::Broker(e.to_string()))?;
		}

		let table = Arc::new(SubscriptionTable::new(local_proxy_id.to_string()));
		let connected = Arc::new(AtomicBool::new(true));

		let listener_table = Arc::clone(&table);
		let listener_connected = Arc::clone(&connected);
		let listener = tokio::spawn(async move {
			let mut stream = pubsub.into_on_message();
			while let Some(msg) = stream.next().await {
				let channel = msg.get_channel_name().to_string();
				let payload: String = match msg.get_payload() {
					Ok(p) => p,
					Err(e) => {
						warn!(channel = %channel, error = %e, "unreadable broker payload, skipping");
						continue;
					}
				};

				let message: ClusterMessage = match serde_json::from_str(&payload) {
					Ok(m) => m,
					Err(e) => {
						warn!(channel = %channel, error = %e, "undecodable cluster message, skipping");
						continue;
					}
				};

				metrics::counter!("numdrassl_cluster_messages_in_total").increment(1);
				listener_table.dispatch(&channel, &message);
			}

			listener_connected.store(false, Ordering::Release);
			warn!("broker subscriber connection closed");
		});

		info!("broker messaging service connected");
		Ok(RedisMessagingService {
			table,
			publish_conn,
			connected,
			listener,
		})
	}
}

#[async_trait]
impl MessagingService for RedisMessagingService {
	async fn publish(&self, channel: &str, message: ClusterMessage) -> Result<(), MessagingError> {
		if !self.is_connected() {
			return Err(MessagingError::Disconnected);
		}

		let json = serde_json::to_string(&message).map_err(|e| MessagingError::Encode(e.to_string()))?;

		let mut conn = self.publish_conn.clone();
		match conn.publish::<_, _, i64>(channel, json).await {
			Ok(receivers) => {
				metrics::counter!("numdrassl_cluster_messages_out_total").increment(1);
				debug!(channel, receivers, "published cluster message");
				Ok(())
			}
			Err(e) => {
				self.connected.store(false, Ordering::Release);
				warn!(channel, error = %e, "broker publish failed, marking disconnected");
				Err(MessagingError::Broker(e.to_string()))
			}
		}
	}

	fn subscribe(&self, channel: &str, options: SubscribeOptions, handler: MessageHandler) -> SubscriptionId {
		self.table.add(channel, options, handler)
	}

	fn unsubscribe(&self, id: SubscriptionId) {
		self.table.remove(id);
	}

	fn unsubscribe_all(&self, channel: &str) {
		self.table.remove_channel(channel);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Acquire)
	}

	async fn shutdown(&self) {
		self.connected.store(false, Ordering::Release);
		self.listener.abort();
		self.table.clear();
		info!("broker messaging service shut down");
	}
}

fn redis_url(config: &ClusterConfig) -> String {
	let scheme = if config.redis_ssl { "rediss" } else { "redis" };
	let auth = match config.redis_password.as_deref() {
		Some(password) if !password.is_empty() => format!(":{password}@"),
		_ => String::new(),
	};
	format!(
		"{scheme}://{auth}{host}:{port}/{db}",
		host = config.redis_host,
		port = config.redis_port,
		db = config.redis_database
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_construction() {
		let mut config = ClusterConfig::default();
		assert_eq!(redis_url(&config), "redis://localhost:6379/0");

		config.redis_password = Some("hunter2".to_string());
		config.redis_ssl = true;
		config.redis_database = 3;
		assert_eq!(redis_url(&config), "rediss://:hunter2@localhost:6379/3");
	}
}
