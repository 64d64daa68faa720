//! The status/work event fan-in.
//!
//! Node status writes are many-producer; the SSE streams and the upstream
//! relay are the consumers. Producers must never block on a slow consumer,
//! so the bus is a bounded broadcast ring: when a consumer lags, it skips
//! the oldest events and recovers from the most-recent-status cache.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex},
};
use tokio::sync::broadcast;

use weir_api::{
	event::{EventModel, WorkUpdate, WORK_UPDATE},
	labels::NodeLabel,
	status::NodeStatus,
};

/// How many events the bus buffers before dropping the oldest.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A bounded, many-producer fan-in of [`EventModel`] records,
/// plus a "latest status per node" cache for replay.
#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<EventModel>,
	recent: Arc<Mutex<BTreeMap<NodeLabel, NodeStatus>>>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self {
			tx,
			recent: Arc::new(Mutex::new(BTreeMap::new())),
		}
	}

	/// Put an event onto the bus. Never blocks.
	///
	/// `WorkUpdate` events also refresh the latest-status cache, including
	/// updates relayed from downstream pipelines.
	pub fn push(&self, event: EventModel) {
		if event.event == WORK_UPDATE {
			if let Ok(update) = serde_json::from_str::<WorkUpdate>(&event.data) {
				if let Ok(mut recent) = self.recent.lock() {
					recent.insert(update.id, update.status);
				}
			}
		}

		// A send error just means nobody is listening yet.
		let _ = self.tx.send(event);
	}

	/// Announce a node status change.
	pub fn push_status(&self, id: &NodeLabel, status: NodeStatus) {
		self.push(EventModel::work_update(id, status));
	}

	/// Subscribe to the live tail of the bus.
	pub fn subscribe(&self) -> broadcast::Receiver<EventModel> {
		self.tx.subscribe()
	}

	/// The most recent status of every node this bus has seen.
	pub fn recent_statuses(&self) -> Vec<(NodeLabel, NodeStatus)> {
		match self.recent.lock() {
			Ok(recent) => recent.iter().map(|(k, v)| (k.clone(), *v)).collect(),
			Err(_) => Vec::new(),
		}
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_BUS_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::broadcast::error::RecvError;

	#[tokio::test]
	async fn producers_never_block_and_oldest_events_drop() {
		let bus = EventBus::new(4);
		let mut rx = bus.subscribe();

		for i in 0..100 {
			bus.push_status(&NodeLabel::new(&format!("n{i}")), NodeStatus::Triggered);
		}

		// The consumer lagged; it is told how much it missed,
		// then reads the newest events.
		match rx.recv().await {
			Err(RecvError::Lagged(n)) => assert!(n >= 90),
			other => panic!("expected lag, got {other:?}"),
		}

		let ev = rx.recv().await.unwrap();
		assert_eq!(ev.event, WORK_UPDATE);
	}

	#[tokio::test]
	async fn recent_cache_tracks_latest_status() {
		let bus = EventBus::default();
		let id = NodeLabel::new("worker");

		bus.push_status(&id, NodeStatus::Initializing);
		bus.push_status(&id, NodeStatus::Executing);

		let recent = bus.recent_statuses();
		assert_eq!(recent, vec![(id, NodeStatus::Executing)]);
	}

	#[tokio::test]
	async fn relayed_work_updates_refresh_the_cache() {
		let bus = EventBus::default();
		bus.push(EventModel {
			event: WORK_UPDATE.into(),
			data: "{\"id\":\"remote_action\",\"status\":\"COMPLETE\"}".into(),
		});

		assert_eq!(
			bus.recent_statuses(),
			vec![(NodeLabel::new("remote_action"), NodeStatus::Complete)]
		);
	}
}
