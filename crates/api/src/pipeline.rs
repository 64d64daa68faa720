//! Pipeline-level models: graph advertisement and server-to-server connection.

use serde::{Deserialize, Serialize};

use crate::{labels::NodeLabel, node::NodeModel};

/// A pipeline's local graph fragment, advertised to peers at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineModel {
	pub nodes: Vec<NodeModel>,
	pub edges: Vec<(NodeLabel, NodeLabel)>,
}

/// Body of `POST /connect` between pipeline servers.
/// The upstream announces where it can be reached for event relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConnectionModel {
	pub predecessor_host: String,
	pub predecessor_port: u16,
}

/// One node in the frontend graph JSON.
/// This is a [`NodeModel`] with its endpoints filled in, so a client
/// can address the node without knowing how the graph is mounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendNode {
	#[serde(flatten)]
	pub node: NodeModel,

	pub id: NodeLabel,
	pub label: NodeLabel,

	/// Base URL of the server hosting this node
	pub origin_url: String,

	/// Where this node's RPC server is mounted
	pub endpoint: String,

	pub header_bar_endpoint: String,
}

/// One edge in the frontend graph JSON.
/// Source and target are node names; remote edges use the last
/// path segment of the remote URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendEdge {
	pub source: NodeLabel,
	pub target: NodeLabel,
}

/// The full federated graph, as returned by `POST /connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendGraph {
	pub name: String,
	pub nodes: Vec<FrontendNode>,
	pub edges: Vec<FrontendEdge>,
}
