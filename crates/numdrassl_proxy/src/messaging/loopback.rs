#![forbid(unsafe_code)]

//! In-process messaging fallback.
//!
//! Same interface and dispatch semantics as the broker-backed service, but
//! messages never leave the process. Used when cluster mode is disabled or
//! the broker is unreachable at startup.

use std::sync::Arc;

use async_trait::async_trait;
use numdrassl_protocol::cluster::ClusterMessage;

use super::{MessageHandler, MessagingError, MessagingService, SubscribeOptions, SubscriptionId, SubscriptionTable};

pub struct LoopbackMessagingService {
	table: Arc<SubscriptionTable>,
}

impl LoopbackMessagingService {
	pub fn new(local_proxy_id: impl Into<String>) -> LoopbackMessagingService {
		LoopbackMessagingService {
			table: Arc::new(SubscriptionTable::new(local_proxy_id.into())),
		}
	}
}

#[async_trait]
impl MessagingService for LoopbackMessagingService {
	async fn publish(&self, channel: &str, message: ClusterMessage) -> Result<(), MessagingError> {
		self.table.dispatch(channel, &message);
		Ok(())
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
		true
	}

	async fn shutdown(&self) {
		self.table.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use numdrassl_protocol::cluster::{BroadcastMessage, ClusterMessage, MessageKind, PlayerCountMessage, channels};
	use std::sync::Mutex;
	use std::time::Duration;

	fn broadcast(source: &str, text: &str) -> ClusterMessage {
		ClusterMessage::Broadcast(BroadcastMessage {
			source_proxy_id: source.to_string(),
			message: text.to_string(),
		})
	}

	async fn drain(received: &Arc<Mutex<Vec<String>>>, expected: usize) -> Vec<String> {
		for _ in 0..100 {
			{
				let guard = received.lock().expect("lock");
				if guard.len() >= expected {
					return guard.clone();
				}
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		received.lock().expect("lock").clone()
	}

	#[tokio::test]
	async fn self_messages_filtered_unless_opted_in() {
		let service = LoopbackMessagingService::new("local");
		let received = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions::default(),
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Broadcast(b) = msg {
					sink.lock().expect("lock").push(format!("filtered:{}", b.message));
				}
				Ok(())
			}),
		);

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions {
				include_self: true,
				kind: None,
			},
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Broadcast(b) = msg {
					sink.lock().expect("lock").push(format!("self:{}", b.message));
				}
				Ok(())
			}),
		);

		service.publish(channels::BROADCAST, broadcast("local", "a")).await.expect("publish");
		service.publish(channels::BROADCAST, broadcast("remote", "b")).await.expect("publish");

		let mut got = drain(&received, 3).await;
		got.sort();
		assert_eq!(got, vec!["filtered:b", "self:a", "self:b"]);
	}

	#[tokio::test]
	async fn kind_filter_applies() {
		let service = LoopbackMessagingService::new("local");
		let received = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::PLAYER_COUNT,
			SubscribeOptions {
				include_self: true,
				kind: Some(MessageKind::PlayerCount),
			},
			Arc::new(move |_chan, msg| {
				sink.lock().expect("lock").push(format!("{:?}", msg.kind()));
				Ok(())
			}),
		);

		service
			.publish(
				channels::PLAYER_COUNT,
				ClusterMessage::PlayerCount(PlayerCountMessage {
					source_proxy_id: "local".to_string(),
					player_count: 5,
				}),
			)
			.await
			.expect("publish");
		service
			.publish(channels::PLAYER_COUNT, broadcast("local", "wrong kind"))
			.await
			.expect("publish");

		let got = drain(&received, 1).await;
		assert_eq!(got, vec!["PlayerCount"]);
	}

	#[tokio::test]
	async fn fifo_per_subscription() {
		let service = LoopbackMessagingService::new("local");
		let received = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions {
				include_self: true,
				kind: None,
			},
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Broadcast(b) = msg {
					sink.lock().expect("lock").push(b.message.clone());
				}
				Ok(())
			}),
		);

		for i in 0..20 {
			service
				.publish(channels::BROADCAST, broadcast("local", &i.to_string()))
				.await
				.expect("publish");
		}

		let got = drain(&received, 20).await;
		let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
		assert_eq!(got, expected);
	}

	#[tokio::test]
	async fn handler_errors_do_not_poison_other_subscribers() {
		let service = LoopbackMessagingService::new("local");
		let received = Arc::new(Mutex::new(Vec::new()));

		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions {
				include_self: true,
				kind: None,
			},
			Arc::new(|_chan, _msg| Err(anyhow::anyhow!("boom"))),
		);

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions {
				include_self: true,
				kind: None,
			},
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Broadcast(b) = msg {
					sink.lock().expect("lock").push(b.message.clone());
				}
				Ok(())
			}),
		);

		service.publish(channels::BROADCAST, broadcast("local", "x")).await.expect("publish");
		service.publish(channels::BROADCAST, broadcast("local", "y")).await.expect("publish");

		let got = drain(&received, 2).await;
		assert_eq!(got, vec!["x", "y"]);
	}

	#[tokio::test]
	async fn unsubscribe_all_stops_delivery() {
		let service = LoopbackMessagingService::new("local");
		let received = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&received);
		service.subscribe(
			channels::BROADCAST,
			SubscribeOptions {
				include_self: true,
				kind: None,
			},
			Arc::new(move |_chan, msg| {
				if let ClusterMessage::Broadcast(b) = msg {
					sink.lock().expect("lock").push(b.message.clone());
				}
				Ok(())
			}),
		);

		service.publish(channels::BROADCAST, broadcast("local", "before")).await.expect("publish");
		let _ = drain(&received, 1).await;

		service.unsubscribe_all(channels::BROADCAST);
		service.publish(channels::BROADCAST, broadcast("local", "after")).await.expect("publish");

		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(received.lock().expect("lock").clone(), vec!["before"]);
	}
}
