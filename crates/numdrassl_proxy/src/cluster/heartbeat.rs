#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use numdrassl_protocol::cluster::{HeartbeatMessage, channels};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::messaging::MessagingService;

/// Interval between heartbeats.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Builds the current heartbeat payload; the flag marks the final heartbeat
/// emitted during shutdown.
pub type HeartbeatSource = Arc<dyn Fn(bool) -> HeartbeatMessage + Send + Sync>;

/// Periodically announces this proxy's identity and load on the heartbeat
/// channel. Exactly one `shutting_down` heartbeat goes out, from `stop`.
pub struct HeartbeatPublisher {
	messaging: Arc<dyn MessagingService>,
	source: HeartbeatSource,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatPublisher {
	pub fn new(messaging: Arc<dyn MessagingService>, source: HeartbeatSource) -> HeartbeatPublisher {
		HeartbeatPublisher {
			messaging,
			source,
			task: Mutex::new(None),
		}
	}

	pub fn start(&self) {
		let messaging = Arc::clone(&self.messaging);
		let source = Arc::clone(&self.source);

		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
			loop {
				ticker.tick().await;
				let heartbeat = source(false);
				debug!(players = heartbeat.player_count, "publishing heartbeat");
				if let Err(e) = messaging.publish(channels::HEARTBEAT, heartbeat.into()).await {
					warn!(error = %e, "heartbeat publish failed");
				}
			}
		});

		*self.task.lock().expect("task lock") = Some(handle);
	}

	/// Stop the periodic task and emit the final shutdown heartbeat.
	pub async fn stop(&self) {
		if let Some(handle) = self.task.lock().expect("task lock").take() {
			handle.abort();
		}

		let farewell = (self.source)(true);
		if let Err(e) = self.messaging.publish(channels::HEARTBEAT, farewell.into()).await {
			warn!(error = %e, "failed to publish shutdown heartbeat");
		}
	}
}
