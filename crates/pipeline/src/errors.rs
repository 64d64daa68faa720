//! Errors we may encounter while building or running a pipeline.

use thiserror::Error;
use weir_api::labels::NodeLabel;
use weir_util::names::NameError;

/// An error in a user-supplied hook (`setup`, `execute`, `before_execution`,
/// and friends). Hooks may fail with anything; the core logs and moves on.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error we encounter while constructing a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
	/// A node has an invalid name
	#[error("invalid name for node `{node}`")]
	InvalidName {
		node: NodeLabel,
		#[source]
		source: NameError,
	},

	/// Two nodes share a name
	#[error("duplicate node name `{name}`")]
	DuplicateNode { name: NodeLabel },

	/// A node names a predecessor that was not registered with the pipeline
	#[error("node `{node}` depends on `{predecessor}`, which is not in this pipeline")]
	UnknownPredecessor {
		node: NodeLabel,
		predecessor: NodeLabel,
	},

	/// Node dependencies do not form a directed acyclic graph
	#[error("node dependencies do not form a directed acyclic graph")]
	NotADag,

	/// A metadata store node has a successor that is not a resource node
	#[error("all successors of metadata store `{store}` must be resource nodes; `{successor}` is not")]
	MetadataSuccessorNotResource {
		store: NodeLabel,
		successor: NodeLabel,
	},

	/// A resource node has a successor that is not an action node
	#[error("all successors of resource node `{resource}` must be action nodes; `{successor}` is not")]
	ResourceSuccessorNotAction {
		resource: NodeLabel,
		successor: NodeLabel,
	},

	/// More than one metadata store was registered
	#[error("only one metadata store node is allowed in a pipeline")]
	MultipleMetadataStores,
}
