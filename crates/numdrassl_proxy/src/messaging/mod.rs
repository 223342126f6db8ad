#![forbid(unsafe_code)]

//! Channel/topic messaging abstraction used by the cluster layer.
//!
//! Two interchangeable implementations share this interface: a broker-backed
//! service ([`redis::RedisMessagingService`]) and an in-process loopback
//! ([`loopback::LoopbackMessagingService`]). Selection happens at boot; on
//! broker failure the proxy degrades to loopback and cluster mode answers
//! false at the facade.

pub mod loopback;
pub mod redis;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use numdrassl_protocol::cluster::{ClusterMessage, MessageKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

/// Handler invoked for every delivered message. Errors are logged and
/// swallowed; a faulty subscriber must not poison the substrate.
pub type MessageHandler = Arc<dyn Fn(&str, &ClusterMessage) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
	/// Deliver messages published by this proxy itself.
	pub include_self: bool,
	/// Only deliver messages of this kind.
	pub kind: Option<MessageKind>,
}

impl SubscribeOptions {
	pub fn of_kind(kind: MessageKind) -> SubscribeOptions {
		SubscribeOptions {
			include_self: false,
			kind: Some(kind),
		}
	}
}

#[derive(Debug, Error)]
pub enum MessagingError {
	#[error("messaging service is not connected")]
	Disconnected,

	#[error("failed to encode message: {0}")]
	Encode(String),

	#[error("broker error: {0}")]
	Broker(String),
}

#[async_trait]
pub trait MessagingService: Send + Sync {
	/// Publish a message to a channel. Fails immediately when disconnected.
	async fn publish(&self, channel: &str, message: ClusterMessage) -> Result<(), MessagingError>;

	/// Install a handler for a channel. Delivery is FIFO per subscription.
	fn subscribe(&self, channel: &str, options: SubscribeOptions, handler: MessageHandler) -> SubscriptionId;

	fn unsubscribe(&self, id: SubscriptionId);

	fn unsubscribe_all(&self, channel: &str);

	fn is_connected(&self) -> bool;

	async fn shutdown(&self);
}

/// Shared subscription bookkeeping and fan-out.
///
/// Each subscription owns a worker task fed through an unbounded channel, so
/// handlers observe messages in publish order without blocking the caller.
pub(crate) struct SubscriptionTable {
	local_proxy_id: String,
	next_id: AtomicU64,
	inner: RwLock<HashMap<String, Vec<SubEntry>>>,
}

struct SubEntry {
	id: SubscriptionId,
	include_self: bool,
	kind: Option<MessageKind>,
	tx: mpsc::UnboundedSender<(String, ClusterMessage)>,
}

impl SubscriptionTable {
	pub(crate) fn new(local_proxy_id: String) -> SubscriptionTable {
		SubscriptionTable {
			local_proxy_id,
			next_id: AtomicU64::new(0),
			inner: RwLock::new(HashMap::new()),
		}
	}

	pub(crate) fn local_proxy_id(&self) -> &str {
		&self.local_proxy_id
	}

	pub(crate) fn add(&self, channel: &str, options: SubscribeOptions, handler: MessageHandler) -> SubscriptionId {
		let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
		let (tx, mut rx) = mpsc::unbounded_channel::<(String, ClusterMessage)>();

		let channel_name = channel.to_string();
		tokio::spawn(async move {
			while let Some((chan, message)) = rx.recv().await {
				if let Err(e) = handler(&chan, &message) {
					warn!(channel = %chan, subscription = id, error = %e, "message handler failed");
				}
			}
			debug!(channel = %channel_name, subscription = id, "subscription worker stopped");
		});

		let mut inner = self.inner.write().expect("subscription lock");
		inner.entry(channel.to_string()).or_default().push(SubEntry {
			id,
			include_self: options.include_self,
			kind: options.kind,
			tx,
		});
		id
	}

	pub(crate) fn remove(&self, id: SubscriptionId) {
		let mut inner = self.inner.write().expect("subscription lock");
		for entries in inner.values_mut() {
			entries.retain(|e| e.id != id);
		}
		inner.retain(|_, entries| !entries.is_empty());
	}

	pub(crate) fn remove_channel(&self, channel: &str) {
		self.inner.write().expect("subscription lock").remove(channel);
	}

	pub(crate) fn clear(&self) {
		self.inner.write().expect("subscription lock").clear();
	}

	/// Fan a message out to every matching subscription on a channel.
	pub(crate) fn dispatch(&self, channel: &str, message: &ClusterMessage) {
		let inner = self.inner.read().expect("subscription lock");
		let Some(entries) = inner.get(channel) else {
			return;
		};

		let from_self = message.source_proxy_id() == self.local_proxy_id;
		for entry in entries {
			if from_self && !entry.include_self {
				continue;
			}
			if let Some(kind) = entry.kind {
				if message.kind() != kind {
					continue;
				}
			}
			// A closed worker is pruned lazily on the next (un)subscribe.
			let _ = entry.tx.send((channel.to_string(), message.clone()));
		}
	}
}
