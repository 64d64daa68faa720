//! Artifact, run, metric, and trigger records as seen over the wire.
//! The core treats these as opaque records owned by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::NodeLabel;

/// Where an artifact entry is in its run window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
	/// Seen, not yet pinned to a run
	New,
	/// Pinned to the active run
	Current,
	/// Released by a finished run
	Old,
}

impl std::fmt::Display for ArtifactState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::New => "new",
			Self::Current => "current",
			Self::Old => "old",
		};
		write!(f, "{s}")
	}
}

/// One artifact entry in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntryModel {
	pub id: i64,
	pub run_id: Option<i64>,
	pub node_name: NodeLabel,

	/// Location relative to the owning resource node's root
	pub location: String,

	pub created_at: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub state: ArtifactState,

	pub hash: Option<String>,
	pub hash_algorithm: Option<String>,
	pub size: Option<i64>,
	pub content_type: Option<String>,
}

/// One node registered with the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
	pub id: i64,
	pub node_name: NodeLabel,
	pub node_type: String,
	pub base_type: crate::status::BaseType,
	pub init_time: DateTime<Utc>,
}

/// One run interval recorded by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunModel {
	pub run_id: i64,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
}

/// One logged metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricModel {
	pub run_id: i64,
	pub node_name: NodeLabel,
	pub name: String,
	pub value: f64,
}

/// One logged parameter or tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamModel {
	pub run_id: i64,
	pub node_name: NodeLabel,
	pub name: String,
	pub value: String,
}

/// One logged trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerModel {
	pub id: i64,
	pub node_name: NodeLabel,
	pub trigger_time: DateTime<Utc>,
	pub message: Option<String>,

	/// The run this trigger was associated with, once one started
	pub run_triggered: Option<i64>,
}
