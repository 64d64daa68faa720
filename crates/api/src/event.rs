//! Status/work event records.

use serde::{Deserialize, Serialize};

use crate::{labels::NodeLabel, status::NodeStatus};

/// The event type emitted on every node status change.
pub const WORK_UPDATE: &str = "WorkUpdate";

/// One record on a pipeline's fan-in queue.
/// `data` is an opaque JSON string; for [`WORK_UPDATE`] events it is a
/// serialized [`WorkUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventModel {
	pub event: String,
	pub data: String,
}

impl EventModel {
	/// Build a `WorkUpdate` event for a node status change.
	pub fn work_update(id: &NodeLabel, status: NodeStatus) -> Self {
		let data = WorkUpdate {
			id: id.clone(),
			status,
		};

		Self {
			event: WORK_UPDATE.into(),
			// A struct of a label and a unit enum cannot fail to serialize
			data: serde_json::to_string(&data).unwrap_or_default(),
		}
	}
}

/// Payload of a `WorkUpdate` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUpdate {
	pub id: NodeLabel,
	pub status: NodeStatus,
}
