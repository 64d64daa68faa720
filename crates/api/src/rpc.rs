//! Request and response bodies for the per-node RPC surface
//! (`/<node>/api/server`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
	artifact::{ArtifactEntryModel, ArtifactState},
	labels::NodeLabel,
	status::BaseType,
};

//
// MARK: Metadata store requests
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeRequest {
	pub node_name: NodeLabel,
	pub node_type: String,
	pub base_type: BaseType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntryRequest {
	pub resource_node_name: NodeLabel,
	pub location: String,
	pub state: ArtifactState,
	pub run_id: Option<i64>,
	pub hash: Option<String>,
	pub hash_algorithm: Option<String>,
	pub size: Option<i64>,
	pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeArtifactsRequest {
	pub resource_node_name: NodeLabel,
	pub entries: Vec<ArtifactEntryModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetricsRequest {
	pub node_name: NodeLabel,
	pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogParamsRequest {
	pub node_name: NodeLabel,
	pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTagsRequest {
	pub node_name: NodeLabel,
	pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTriggerRequest {
	pub node_name: NodeLabel,
	pub message: Option<String>,
}

//
// MARK: Metadata store queries
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryExistsQuery {
	pub resource_node_name: NodeLabel,
	pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumEntriesQuery {
	pub resource_node_name: NodeLabel,
	pub state: Option<ArtifactState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesQuery {
	pub resource_node_name: Option<NodeLabel>,
	pub state: Option<ArtifactState>,
	pub run_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeNameQuery {
	pub node_name: NodeLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
	pub node_name: Option<NodeLabel>,
	pub run_id: Option<i64>,
}

//
// MARK: Metadata store responses
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdResponse {
	pub run_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdResponse {
	pub node_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
	pub exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
	pub count: i64,
}

//
// MARK: Resource server
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStateQuery {
	pub state: ArtifactState,
}

/// Response of a successful `upload_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
	pub filename: String,
	pub bytes_received: u64,
	pub stored_path: String,
}
