#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use super::ProxySession;

/// Live sessions, keyed by session id and by player uuid.
///
/// The store is the sole strong owner of sessions; everything else holds
/// `Arc` clones only for the duration of the work at hand.
///
/// Invariant: at most one session per player uuid. A non-forcing uuid
/// registration (at Connect time) never displaces an existing session; the
/// forcing registration at backend acceptance closes the older session
/// before publishing the new one.
#[derive(Default)]
pub struct SessionStore {
	sessions: RwLock<HashMap<u64, Arc<ProxySession>>>,
	by_uuid: RwLock<HashMap<Uuid, Arc<ProxySession>>>,
}

impl SessionStore {
	pub fn new() -> SessionStore {
		SessionStore::default()
	}

	pub fn insert(&self, session: Arc<ProxySession>) {
		self.sessions.write().expect("sessions lock").insert(session.id(), session);
		metrics::gauge!("numdrassl_active_sessions").increment(1.0);
	}

	/// Remove a session from both maps. The uuid entry is only removed when
	/// it still points at this session, so a displaced session that was
	/// already replaced under its uuid cannot evict its successor.
	pub fn remove(&self, session: &Arc<ProxySession>) -> bool {
		let removed = self.sessions.write().expect("sessions lock").remove(&session.id()).is_some();
		if removed {
			metrics::gauge!("numdrassl_active_sessions").decrement(1.0);
		}

		if let Some(uuid) = session.player_uuid() {
			let mut by_uuid = self.by_uuid.write().expect("uuid lock");
			if by_uuid.get(&uuid).map(|s| s.id()) == Some(session.id()) {
				by_uuid.remove(&uuid);
			}
		}

		removed
	}

	/// Non-forcing uuid registration: records the mapping for visibility but
	/// leaves any existing live session in place.
	pub fn register_uuid(&self, session: &Arc<ProxySession>) -> bool {
		let Some(uuid) = session.player_uuid() else {
			return false;
		};

		let mut by_uuid = self.by_uuid.write().expect("uuid lock");
		match by_uuid.get(&uuid) {
			Some(existing) if existing.id() != session.id() => {
				debug!(
					session = session.id(),
					other = existing.id(),
					%uuid,
					"uuid already registered to another session, deferring conflict to backend accept"
				);
				false
			}
			_ => {
				by_uuid.insert(uuid, Arc::clone(session));
				true
			}
		}
	}

	/// Forcing uuid registration, used at backend acceptance: any other live
	/// session holding the uuid is closed synchronously before the new
	/// session is published. Returns the displaced session, already closed
	/// and removed from the store, so the caller can fire its closed hook.
	pub fn register_uuid_forcing(&self, session: &Arc<ProxySession>) -> Option<Arc<ProxySession>> {
		let uuid = session.player_uuid()?;

		let displaced = {
			let mut by_uuid = self.by_uuid.write().expect("uuid lock");
			let displaced = match by_uuid.get(&uuid) {
				Some(existing) if existing.id() != session.id() => Some(Arc::clone(existing)),
				_ => None,
			};

			// The older session is fully closed before the newer one is
			// published under the uuid.
			if let Some(old) = &displaced {
				info!(
					session = session.id(),
					displaced = old.id(),
					%uuid,
					"duplicate player uuid, closing older session"
				);
				old.close("You logged in from another location");
			}
			by_uuid.insert(uuid, Arc::clone(session));
			displaced
		};

		if let Some(old) = displaced {
			if self.sessions.write().expect("sessions lock").remove(&old.id()).is_some() {
				metrics::gauge!("numdrassl_active_sessions").decrement(1.0);
			}
			return Some(old);
		}

		None
	}

	pub fn get(&self, id: u64) -> Option<Arc<ProxySession>> {
		self.sessions.read().expect("sessions lock").get(&id).cloned()
	}

	pub fn get_by_uuid(&self, uuid: Uuid) -> Option<Arc<ProxySession>> {
		self.by_uuid.read().expect("uuid lock").get(&uuid).cloned()
	}

	pub fn get_by_name(&self, username: &str) -> Option<Arc<ProxySession>> {
		self.sessions
			.read()
			.expect("sessions lock")
			.values()
			.find(|s| s.username().as_deref().is_some_and(|n| n.eq_ignore_ascii_case(username)))
			.cloned()
	}

	pub fn all(&self) -> Vec<Arc<ProxySession>> {
		self.sessions.read().expect("sessions lock").values().cloned().collect()
	}

	pub fn count(&self) -> usize {
		self.sessions.read().expect("sessions lock").len()
	}

	/// Sessions currently attached to the named backend.
	pub fn players_on_backend(&self, backend_name: &str) -> Vec<Arc<ProxySession>> {
		self.sessions
			.read()
			.expect("sessions lock")
			.values()
			.filter(|s| {
				s.current_backend()
					.map(|b| b.same_name(backend_name))
					.unwrap_or(false)
			})
			.cloned()
			.collect()
	}

	pub fn close_all(&self, reason: &str) {
		let sessions: Vec<_> = {
			let mut map = self.sessions.write().expect("sessions lock");
			map.drain().map(|(_, s)| s).collect()
		};
		self.by_uuid.write().expect("uuid lock").clear();

		for session in sessions {
			session.close(reason);
			metrics::gauge!("numdrassl_active_sessions").decrement(1.0);
		}
	}
}
