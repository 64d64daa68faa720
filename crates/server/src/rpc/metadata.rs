//! Metadata RPC: the server router over a local store, and the client
//! that speaks the same [`MetadataStore`] interface from another process.

use async_trait::async_trait;
use axum::{
	extract::{Query, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
	collections::BTreeMap,
	sync::{Arc, RwLock},
};
use tracing::{info, warn};

use weir_api::{
	artifact::{ArtifactEntryModel, ArtifactState, MetricModel, NodeRecord, ParamModel, RunModel},
	labels::NodeLabel,
	node::{MessageResponse, RpcConnectionModel},
	rpc::{
		AddNodeRequest, CountResponse, CreateEntryRequest, EntriesQuery, EntryExistsQuery,
		ExistsResponse, HistoryQuery, LogMetricsRequest, LogParamsRequest, LogTriggerRequest,
		MergeArtifactsRequest, NodeIdResponse, NodeNameQuery, NumEntriesQuery, RunIdResponse,
		SetTagsRequest,
	},
	status::BaseType,
};
use weir_pipeline::node::{MetadataError, MetadataStore};

use super::{RpcClient, RpcError};

//
// MARK: Server
//

fn meta_err(error: MetadataError) -> Response {
	let status = match &error {
		MetadataError::NoSuchNode(_) | MetadataError::NoSuchEntry(_) => StatusCode::NOT_FOUND,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	return (status, error.to_string()).into_response();
}

/// The RPC router for a metadata store node.
pub(crate) fn router(store: Arc<dyn MetadataStore>) -> Router {
	Router::new()
		.route("/add_node", post(add_node))
		.route("/get_run_id", get(get_run_id))
		.route("/get_node_id", get(get_node_id))
		.route("/create_entry", post(create_entry))
		.route("/merge_artifacts_table", post(merge_artifacts_table))
		.route("/entry_exists", get(entry_exists))
		.route("/log_metrics", post(log_metrics))
		.route("/log_params", post(log_params))
		.route("/set_tags", post(set_tags))
		.route("/get_metrics", get(get_metrics))
		.route("/get_params", get(get_params))
		.route("/get_tags", get(get_tags))
		.route("/log_trigger", post(log_trigger))
		.route("/get_num_entries", get(get_num_entries))
		.route("/get_entries", get(get_entries))
		.with_state(store)
}

async fn add_node(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<AddNodeRequest>,
) -> Response {
	match store
		.add_node(&body.node_name, &body.node_type, body.base_type)
		.await
	{
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_run_id(State(store): State<Arc<dyn MetadataStore>>) -> Response {
	match store.get_run_id().await {
		Ok(run_id) => Json(RunIdResponse { run_id }).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_node_id(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<NodeNameQuery>,
) -> Response {
	match store.get_node_id(&query.node_name).await {
		Ok(node_id) => Json(NodeIdResponse { node_id }).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn create_entry(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<CreateEntryRequest>,
) -> Response {
	match store.create_entry(body).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn merge_artifacts_table(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<MergeArtifactsRequest>,
) -> Response {
	match store
		.merge_artifacts_table(&body.resource_node_name, body.entries)
		.await
	{
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn entry_exists(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<EntryExistsQuery>,
) -> Response {
	match store
		.entry_exists(&query.resource_node_name, &query.location)
		.await
	{
		Ok(exists) => Json(ExistsResponse { exists }).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn log_metrics(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<LogMetricsRequest>,
) -> Response {
	match store.log_metrics(&body.node_name, body.metrics).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn log_params(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<LogParamsRequest>,
) -> Response {
	match store.log_params(&body.node_name, body.params).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn set_tags(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<SetTagsRequest>,
) -> Response {
	match store.set_tags(&body.node_name, body.tags).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_metrics(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<HistoryQuery>,
) -> Response {
	match store.get_metrics(query).await {
		Ok(metrics) => Json(metrics).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_params(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<HistoryQuery>,
) -> Response {
	match store.get_params(query).await {
		Ok(params) => Json(params).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_tags(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<HistoryQuery>,
) -> Response {
	match store.get_tags(query).await {
		Ok(tags) => Json(tags).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn log_trigger(
	State(store): State<Arc<dyn MetadataStore>>,
	Json(body): Json<LogTriggerRequest>,
) -> Response {
	match store
		.log_trigger(&body.node_name, body.message.as_deref())
		.await
	{
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_num_entries(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<NumEntriesQuery>,
) -> Response {
	match store
		.get_num_entries(&query.resource_node_name, query.state)
		.await
	{
		Ok(count) => Json(CountResponse { count }).into_response(),
		Err(error) => meta_err(error),
	}
}

async fn get_entries(
	State(store): State<Arc<dyn MetadataStore>>,
	Query(query): Query<EntriesQuery>,
) -> Response {
	match store.get_entries(query).await {
		Ok(entries) => Json(entries).into_response(),
		Err(error) => meta_err(error),
	}
}

//
// MARK: Client
//

/// A [`MetadataStore`] that lives in another process.
///
/// The client learns its `server_url` either from configuration or from
/// the server's `POST /connect` at federation time. Calls made before
/// that return [`MetadataError::NotConnected`]. Nothing is cached: every
/// call is a round trip.
pub struct MetadataStoreClient {
	client_name: String,
	server_url: RwLock<Option<String>>,
	http: reqwest::Client,
}

impl MetadataStoreClient {
	pub fn new(client_name: &str) -> Self {
		Self {
			client_name: client_name.into(),
			server_url: RwLock::new(None),
			http: reqwest::Client::new(),
		}
	}

	/// A client with a known server, for callers outside any pipeline
	/// server (e.g. logging metrics from a deployment environment).
	pub fn with_server_url(client_name: &str, server_url: &str) -> Self {
		Self {
			client_name: client_name.into(),
			server_url: RwLock::new(Some(server_url.into())),
			http: reqwest::Client::new(),
		}
	}

	pub fn server_url(&self) -> Option<String> {
		self.server_url.read().ok().and_then(|x| x.clone())
	}

	fn endpoint(&self, path: &str) -> Result<String, MetadataError> {
		match self.server_url() {
			Some(base) => Ok(format!("{base}/{path}")),
			None => Err(MetadataError::NotConnected),
		}
	}

	fn rpc_err(error: reqwest::Error) -> MetadataError {
		MetadataError::Rpc(error.to_string())
	}

	async fn check(response: reqwest::Response) -> Result<reqwest::Response, MetadataError> {
		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(MetadataError::Rpc(format!("status {status}: {body}")));
		}
		return Ok(response);
	}

	async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), MetadataError> {
		let url = self.endpoint(path)?;
		let response = self
			.http
			.post(url)
			.json(body)
			.send()
			.await
			.map_err(Self::rpc_err)?;
		Self::check(response).await?;
		return Ok(());
	}

	async fn get_json<Q: Serialize, R: DeserializeOwned>(
		&self,
		path: &str,
		query: &Q,
	) -> Result<R, MetadataError> {
		let url = self.endpoint(path)?;
		let response = self
			.http
			.get(url)
			.query(query)
			.send()
			.await
			.map_err(Self::rpc_err)?;
		let response = Self::check(response).await?;
		return response.json().await.map_err(Self::rpc_err);
	}
}

impl RpcClient for MetadataStoreClient {
	fn client_name(&self) -> &str {
		&self.client_name
	}

	fn client_router(self: Arc<Self>) -> Router {
		Router::new()
			.route("/connect", post(client_connect))
			.with_state(self)
	}

	fn is_metadata(&self) -> bool {
		true
	}
}

/// A node server announces itself; from here on the client is usable.
async fn client_connect(
	State(client): State<Arc<MetadataStoreClient>>,
	Json(server): Json<RpcConnectionModel>,
) -> Response {
	info!(
		message = "Server connected to metadata client",
		client = client.client_name,
		server_url = server.url,
	);

	match client.server_url.write() {
		Ok(mut url) => *url = Some(server.url.clone()),
		Err(_) => {
			warn!(message = "Metadata client lock poisoned");
			return StatusCode::INTERNAL_SERVER_ERROR.into_response();
		}
	}

	return Json(MessageResponse {
		message: format!(
			"client `{}` connected to server at `{}`",
			client.client_name, server.url
		),
	})
	.into_response();
}

#[async_trait]
impl MetadataStore for MetadataStoreClient {
	async fn add_node(
		&self,
		node_name: &NodeLabel,
		node_type: &str,
		base_type: BaseType,
	) -> Result<(), MetadataError> {
		self.post_json(
			"add_node",
			&AddNodeRequest {
				node_name: node_name.clone(),
				node_type: node_type.into(),
				base_type,
			},
		)
		.await
	}

	async fn node_exists(&self, node_name: &NodeLabel) -> Result<bool, MetadataError> {
		// the server has no dedicated endpoint for this; an id lookup
		// answers the same question
		match self.get_node_id(node_name).await {
			Ok(_) => Ok(true),
			Err(MetadataError::Rpc(message)) if message.contains("404") => Ok(false),
			Err(error) => Err(error),
		}
	}

	async fn get_node_id(&self, node_name: &NodeLabel) -> Result<i64, MetadataError> {
		let response: NodeIdResponse = self
			.get_json(
				"get_node_id",
				&NodeNameQuery {
					node_name: node_name.clone(),
				},
			)
			.await?;
		return Ok(response.node_id);
	}

	async fn get_nodes_info(&self) -> Result<Vec<NodeRecord>, MetadataError> {
		// not exposed over RPC; peers exchange graph fragments through
		// the pipeline-level connect instead
		return Ok(Vec::new());
	}

	async fn get_run_id(&self) -> Result<i64, MetadataError> {
		let url = self.endpoint("get_run_id")?;
		let response = self.http.get(url).send().await.map_err(Self::rpc_err)?;
		let response = Self::check(response).await?;
		let response: RunIdResponse = response.json().await.map_err(Self::rpc_err)?;
		return Ok(response.run_id);
	}

	async fn start_run(&self, _run_id: i64) -> Result<(), MetadataError> {
		// runs are owned by the metadata store's own node, never by peers
		return Err(MetadataError::Rpc(
			"start_run cannot be called remotely".into(),
		));
	}

	async fn end_run(&self, _run_id: i64) -> Result<(), MetadataError> {
		return Err(MetadataError::Rpc(
			"end_run cannot be called remotely".into(),
		));
	}

	async fn get_runs(&self) -> Result<Vec<RunModel>, MetadataError> {
		return Ok(Vec::new());
	}

	async fn create_entry(&self, entry: CreateEntryRequest) -> Result<(), MetadataError> {
		self.post_json("create_entry", &entry).await
	}

	async fn entry_exists(
		&self,
		resource_node_name: &NodeLabel,
		location: &str,
	) -> Result<bool, MetadataError> {
		let response: ExistsResponse = self
			.get_json(
				"entry_exists",
				&EntryExistsQuery {
					resource_node_name: resource_node_name.clone(),
					location: location.into(),
				},
			)
			.await?;
		return Ok(response.exists);
	}

	async fn update_entry(
		&self,
		_resource_node_name: &NodeLabel,
		entry_id: i64,
		_state: ArtifactState,
		_run_id: Option<i64>,
	) -> Result<(), MetadataError> {
		// entry state transitions are driven by the store's own run loop;
		// remote peers only ever create entries
		return Err(MetadataError::NoSuchEntry(entry_id));
	}

	async fn get_num_entries(
		&self,
		resource_node_name: &NodeLabel,
		state: Option<ArtifactState>,
	) -> Result<i64, MetadataError> {
		let response: CountResponse = self
			.get_json(
				"get_num_entries",
				&NumEntriesQuery {
					resource_node_name: resource_node_name.clone(),
					state,
				},
			)
			.await?;
		return Ok(response.count);
	}

	async fn get_entries(
		&self,
		query: EntriesQuery,
	) -> Result<Vec<ArtifactEntryModel>, MetadataError> {
		self.get_json("get_entries", &query).await
	}

	async fn merge_artifacts_table(
		&self,
		resource_node_name: &NodeLabel,
		entries: Vec<ArtifactEntryModel>,
	) -> Result<(), MetadataError> {
		self.post_json(
			"merge_artifacts_table",
			&MergeArtifactsRequest {
				resource_node_name: resource_node_name.clone(),
				entries,
			},
		)
		.await
	}

	async fn log_metrics(
		&self,
		node_name: &NodeLabel,
		metrics: BTreeMap<String, f64>,
	) -> Result<(), MetadataError> {
		self.post_json(
			"log_metrics",
			&LogMetricsRequest {
				node_name: node_name.clone(),
				metrics,
			},
		)
		.await
	}

	async fn log_params(
		&self,
		node_name: &NodeLabel,
		params: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		self.post_json(
			"log_params",
			&LogParamsRequest {
				node_name: node_name.clone(),
				params,
			},
		)
		.await
	}

	async fn set_tags(
		&self,
		node_name: &NodeLabel,
		tags: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		self.post_json(
			"set_tags",
			&SetTagsRequest {
				node_name: node_name.clone(),
				tags,
			},
		)
		.await
	}

	async fn get_metrics(&self, query: HistoryQuery) -> Result<Vec<MetricModel>, MetadataError> {
		self.get_json("get_metrics", &query).await
	}

	async fn get_params(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		self.get_json("get_params", &query).await
	}

	async fn get_tags(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		self.get_json("get_tags", &query).await
	}

	async fn log_trigger(
		&self,
		node_name: &NodeLabel,
		message: Option<&str>,
	) -> Result<(), MetadataError> {
		self.post_json(
			"log_trigger",
			&LogTriggerRequest {
				node_name: node_name.clone(),
				message: message.map(|x| x.into()),
			},
		)
		.await
	}
}
