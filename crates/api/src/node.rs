//! Node description models exchanged during federation.

use serde::{Deserialize, Serialize};

use crate::{
	labels::NodeLabel,
	status::{BaseType, NodeResult},
};

/// A description of one node, as advertised to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeModel {
	pub name: NodeLabel,

	/// The concrete type label of this node (free-form)
	pub node_type: String,

	/// The archetype of this node
	pub base_type: BaseType,

	/// Local predecessor names
	pub predecessors: Vec<NodeLabel>,

	/// Local successor names
	pub successors: Vec<NodeLabel>,
}

/// A [`NodeModel`] plus the URL the node is reachable at.
///
/// This is the body of every `/connector` call: connection requests,
/// forward signals, and backward signals all identify the caller this way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnectionModel {
	#[serde(flatten)]
	pub node: NodeModel,

	/// Where the sending node's connector is mounted,
	/// e.g. `http://host:port/node_name`
	pub node_url: String,

	/// The result carried alongside a signal.
	/// Not set on plain connection requests.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<NodeResult>,
}

/// Body of `POST /<client>/api/client/connect`:
/// a node server announcing itself to its remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConnectionModel {
	pub url: String,
}

/// Generic acknowledgement body for connector calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
	pub message: String,
}
