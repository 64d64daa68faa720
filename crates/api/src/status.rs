//! The finite state vocabulary of a node.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Where a node is in its life cycle.
///
/// This is single-writer, many-reader state: only the node's own task
/// writes it, and every write is announced as a `WorkUpdate` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
	/// Created, not yet set up
	Off,
	/// Running `setup()`
	Initializing,
	/// A resource node waiting on its trigger
	WaitingResource,
	/// A metadata store waiting on its trigger
	WaitingMetrics,
	/// Trigger fired, run about to start
	Triggered,
	/// An action node running `before_execution`
	Preparation,
	/// An action node running `execute`
	Executing,
	/// An action node running `after_execution`
	Cleanup,
	/// Blocked in `wait_for_successors`
	WaitingSuccessors,
	/// Blocked in `wait_for_predecessors`
	WaitingPredecessors,
	/// Paused by the user
	Paused,
	/// Last execution finished successfully
	Complete,
	/// Last execution returned false
	Failure,
	/// Last execution returned an error or panicked
	Error,
	/// This node was skipped
	Skipped,
	/// This node's loop has returned
	Exited,
}

impl Display for NodeStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::Off => "OFF",
			Self::Initializing => "INITIALIZING",
			Self::WaitingResource => "WAITING_RESOURCE",
			Self::WaitingMetrics => "WAITING_METRICS",
			Self::Triggered => "TRIGGERED",
			Self::Preparation => "PREPARATION",
			Self::Executing => "EXECUTING",
			Self::Cleanup => "CLEANUP",
			Self::WaitingSuccessors => "WAITING_SUCCESSORS",
			Self::WaitingPredecessors => "WAITING_PREDECESSORS",
			Self::Paused => "PAUSED",
			Self::Complete => "COMPLETE",
			Self::Failure => "FAILURE",
			Self::Error => "ERROR",
			Self::Skipped => "SKIPPED",
			Self::Exited => "EXITED",
		};
		write!(f, "{s}")
	}
}

/// The outcome a node reports when it signals its neighbors.
///
/// Latches do not interpret this; action nodes read it out-of-band
/// to drive their own state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeResult {
	Success,
	Failure,
	Error,
}

impl Display for NodeResult {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::Success => "SUCCESS",
			Self::Failure => "FAILURE",
			Self::Error => "ERROR",
		};
		write!(f, "{s}")
	}
}

/// A node's archetype.
/// The archetype fixes the shape of a node's run loop and which
/// neighbors it may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseType {
	MetadataStore,
	Resource,
	Action,
}

impl Display for BaseType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::MetadataStore => "metadata_store",
			Self::Resource => "resource",
			Self::Action => "action",
		};
		write!(f, "{s}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_wire_symbols() {
		assert_eq!(
			serde_json::to_string(&NodeStatus::WaitingResource).unwrap(),
			"\"WAITING_RESOURCE\""
		);
		assert_eq!(
			serde_json::from_str::<NodeStatus>("\"EXITED\"").unwrap(),
			NodeStatus::Exited
		);
		assert_eq!(
			serde_json::to_string(&BaseType::MetadataStore).unwrap(),
			"\"metadata_store\""
		);
	}
}
