//! The pipeline server: hosts one pipeline, its HTTP surface, and the
//! event relay.

use axum::{
	extract::{DefaultBodyLimit, Query, State},
	response::{
		sse::{Event, KeepAlive, Sse},
		Html, IntoResponse, Response,
	},
	routing::{get, post},
	Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use std::{
	collections::VecDeque,
	convert::Infallible,
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use weir_api::{
	event::EventModel,
	node::{NodeConnectionModel, RpcConnectionModel},
	pipeline::{FrontendGraph, PipelineConnectionModel},
	status::{BaseType, NodeStatus},
};
use weir_pipeline::{
	events::EventBus,
	latch::Latch,
	node::{Node, ResourceNode},
	pipeline::Pipeline,
};

use crate::{
	connector,
	errors::ServerError,
	frontend::{self, frontend_graph, remote_node_name},
	rpc::{self, RpcClient},
};

/// How many events the relay buffers while the upstream is unreachable.
const RELAY_PENDING_CAP: usize = 1024;

/// How often the relay retries a non-empty buffer.
const RELAY_RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Shared state behind every pipeline-level HTTP handler.
pub(crate) struct ServerState {
	pub name: String,
	pub host: String,
	pub port: u16,
	pub pipeline: Arc<Pipeline>,
	pub bus: EventBus,

	/// Coordinates of the upstream server, recorded by `POST /connect`
	pub upstream: Mutex<Option<(String, u16)>>,

	/// True between `POST /finish_connect` and the next relay failure
	pub connected: AtomicBool,

	/// Graph fragments collected from downstream servers at connect time
	pub successor_models: Mutex<Vec<FrontendGraph>>,

	pub http: reqwest::Client,
}

impl ServerState {
	pub fn origin(&self) -> String {
		format!("http://{}:{}", self.host, self.port)
	}
}

/// One process hosting one [`Pipeline`] behind an HTTP listener.
pub struct PipelineServer {
	name: String,
	host: String,
	port: u16,
	pipeline: Arc<Pipeline>,
	remote_clients: Vec<Arc<dyn RpcClient>>,
	bus: EventBus,
}

impl PipelineServer {
	/// Make a new server for the given pipeline.
	///
	/// `host` and `port` are the coordinates this server advertises to
	/// its peers; the listener binds to them too. A port of `0` picks a
	/// free port and advertises whatever was bound (useful in tests).
	pub fn new(
		name: &str,
		host: &str,
		port: u16,
		pipeline: Pipeline,
		remote_clients: Vec<Arc<dyn RpcClient>>,
	) -> Result<Self, ServerError> {
		let n_metadata_clients = remote_clients.iter().filter(|c| c.is_metadata()).count();
		if n_metadata_clients > 1 {
			return Err(ServerError::MultipleMetadataClients);
		}

		return Ok(Self {
			name: name.into(),
			host: host.into(),
			port,
			pipeline: Arc::new(pipeline),
			remote_clients,
			bus: EventBus::default(),
		});
	}

	pub fn bus(&self) -> &EventBus {
		&self.bus
	}

	/// Base URLs of every downstream pipeline server, derived from the
	/// remote successor URLs of all local nodes.
	fn downstream_servers(&self) -> Result<Vec<String>, ServerError> {
		let mut servers: Vec<String> = Vec::new();

		for node in self.pipeline.nodes() {
			for remote in node.core().remote_successors() {
				let parsed = url::Url::parse(remote).map_err(|_| ServerError::BadRemoteUrl {
					url: remote.clone(),
				})?;

				let origin = match (parsed.host_str(), parsed.port_or_known_default()) {
					(Some(host), Some(port)) => {
						format!("{}://{}:{}", parsed.scheme(), host, port)
					}
					_ => {
						return Err(ServerError::BadRemoteUrl {
							url: remote.clone(),
						})
					}
				};

				if !servers.contains(&origin) {
					servers.push(origin);
				}
			}
		}

		return Ok(servers);
	}

	/// Bind, mount everything, run the connect procedure, launch nodes.
	/// Returns a handle the hosting process uses to shut down.
	pub async fn start(self) -> Result<ServerHandle, ServerError> {
		let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
		let addr = listener.local_addr()?;
		let port = if self.port == 0 { addr.port() } else { self.port };
		let origin = format!("http://{}:{}", self.host, port);

		// Every node learns where its connector lives before anything
		// can signal through it.
		for node in self.pipeline.nodes() {
			node.core()
				.set_node_url(format!("{origin}/{}", node.core().name()));
		}
		self.pipeline.attach_events(&self.bus);

		let downstream = self.downstream_servers()?;

		let state = Arc::new(ServerState {
			name: self.name.clone(),
			host: self.host.clone(),
			port,
			pipeline: self.pipeline.clone(),
			bus: self.bus.clone(),
			upstream: Mutex::new(None),
			connected: AtomicBool::new(false),
			successor_models: Mutex::new(Vec::new()),
			http: reqwest::Client::new(),
		});

		let app = build_router(state.clone(), &self.remote_clients);

		let shutdown = Arc::new(Latch::new());

		let serve = {
			let shutdown = shutdown.clone();
			let server = axum::serve(listener, app)
				.with_graceful_shutdown(async move { shutdown.wait().await });

			tokio::spawn(async move {
				match server.await {
					Ok(()) => {}
					Err(error) => error!(message = "HTTP server failed", %error),
				}
			})
		};

		let relay = tokio::spawn(relay_task(state.clone(), shutdown.clone()));

		info!(
			message = "Pipeline server started",
			name = state.name,
			origin,
		);

		// Wire the federation exactly once, now that the listener is up.
		// A pipeline that cannot wire its federation cannot run.
		match connect(&state, &downstream).await {
			Ok(()) => {}
			Err(error) => {
				shutdown.set();
				return Err(error);
			}
		}

		self.pipeline.launch_nodes().await;

		return Ok(ServerHandle {
			addr,
			state,
			pipeline: self.pipeline,
			shutdown,
			serve,
			relay,
		});
	}

	/// Run until SIGINT or SIGTERM, then stop the HTTP server and
	/// terminate the pipeline.
	pub async fn run(self) -> Result<(), ServerError> {
		let handle = self.start().await?;
		shutdown_signal().await;
		info!(message = "Shutdown signal caught");
		handle.shutdown().await;
		return Ok(());
	}
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		let mut sigterm =
			match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				Ok(x) => x,
				Err(error) => {
					error!(message = "Could not install SIGTERM handler", %error);
					let _ = tokio::signal::ctrl_c().await;
					return;
				}
			};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = sigterm.recv() => {},
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

/// A running pipeline server.
pub struct ServerHandle {
	addr: SocketAddr,
	state: Arc<ServerState>,
	pipeline: Arc<Pipeline>,
	shutdown: Arc<Latch>,
	serve: JoinHandle<()>,
	relay: JoinHandle<()>,
}

impl ServerHandle {
	pub fn addr(&self) -> SocketAddr {
		self.addr
	}

	pub fn port(&self) -> u16 {
		self.state.port
	}

	pub fn origin(&self) -> String {
		self.state.origin()
	}

	pub fn pipeline(&self) -> &Arc<Pipeline> {
		&self.pipeline
	}

	pub fn bus(&self) -> &EventBus {
		&self.state.bus
	}

	/// Stop the HTTP server, then terminate the pipeline.
	pub async fn shutdown(self) {
		self.shutdown.set();

		match self.serve.await {
			Ok(()) => {}
			Err(error) => warn!(message = "HTTP task panicked", %error),
		}

		self.pipeline.terminate_nodes().await;

		match self.relay.await {
			Ok(()) => {}
			Err(error) => warn!(message = "Relay task panicked", %error),
		}
	}
}

//
// MARK: Router
//

fn build_router(state: Arc<ServerState>, remote_clients: &[Arc<dyn RpcClient>]) -> Router {
	let mut app = Router::new()
		.route("/connect", post(pipeline_connect))
		.route("/finish_connect", post(finish_connect))
		.route("/send_event", post(send_event))
		.route("/graph_sse", get(graph_sse))
		.route("/header_bar", get(header_bar))
		.with_state(state.clone());

	for node in state.pipeline.nodes() {
		let name = node.core().name().clone();

		app = app.nest(
			&format!("/{name}/connector"),
			connector::router(node.core().clone()),
		);

		match node.core().base_type() {
			BaseType::MetadataStore => {
				if let Some(store) = node.metadata_store() {
					app = app.nest(&format!("/{name}/api/server"), rpc::metadata::router(store));
				}
			}
			BaseType::Resource => {
				if let Ok(resource) = node.clone().as_any_arc().downcast::<ResourceNode>() {
					app = app.nest(&format!("/{name}/api/server"), rpc::resource::router(resource));
				}
			}
			// action nodes expose no RPC operations
			BaseType::Action => {}
		}
	}

	for client in remote_clients {
		app = app.nest(
			&format!("/{}/api/client", client.client_name()),
			client.clone().client_router(),
		);
	}

	return app
		.layer(TraceLayer::new_for_http())
		// artifact uploads are streamed and may be arbitrarily large
		.layer(DefaultBodyLimit::disable());
}

//
// MARK: Pipeline-level handlers
//

/// A downstream pipeline learns who its upstream is; the upstream learns
/// our graph.
async fn pipeline_connect(
	State(state): State<Arc<ServerState>>,
	Json(connection): Json<PipelineConnectionModel>,
) -> Json<FrontendGraph> {
	info!(
		message = "Upstream server connected",
		name = state.name,
		upstream_host = connection.predecessor_host,
		upstream_port = connection.predecessor_port,
	);

	if let Ok(mut upstream) = state.upstream.lock() {
		*upstream = Some((connection.predecessor_host, connection.predecessor_port));
	}

	return Json(frontend_graph(&state));
}

/// The upstream finished wiring; release every node that was waiting on
/// the connection, and start relaying events.
async fn finish_connect(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
	for node in state.pipeline.nodes() {
		node.core().set_connected();
	}

	state.connected.store(true, Ordering::SeqCst);
	info!(message = "Connection procedure finished", name = state.name);

	return Json(serde_json::json!({"status": "ok"}));
}

/// Further-downstream pipelines relay their events through us.
async fn send_event(
	State(state): State<Arc<ServerState>>,
	Json(event): Json<EventModel>,
) -> Json<serde_json::Value> {
	state.bus.push(event);
	return Json(serde_json::json!({"status": "ok"}));
}

/// Live status stream. New clients first get the most recent
/// non-INITIALIZING status of every known node, then the live tail.
async fn graph_sse(
	State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	// subscribe before snapshotting so nothing falls in the gap
	let mut rx = state.bus.subscribe();
	let recent = state.bus.recent_statuses();

	let stream = async_stream::stream! {
		for (id, status) in recent {
			if status == NodeStatus::Initializing {
				continue;
			}
			let event = EventModel::work_update(&id, status);
			yield Ok(Event::default().event(event.event).data(event.data));
		}

		loop {
			match rx.recv().await {
				Ok(event) => {
					yield Ok(Event::default().event(event.event).data(event.data));
				}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
					debug!(message = "SSE client lagged", skipped);
				}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => {
					// advise the client to reconnect
					yield Ok(Event::default().event("close").data(""));
					break;
				}
			}
		}
	};

	return Sse::new(stream).keep_alive(KeepAlive::default());
}

#[derive(Deserialize)]
struct HeaderBarQuery {
	node_id: String,
	#[serde(default)]
	visibility: bool,
}

async fn header_bar(
	State(state): State<Arc<ServerState>>,
	Query(query): Query<HeaderBarQuery>,
) -> Response {
	let graph = frontend_graph(&state);

	let fragments: Vec<String> = graph
		.nodes
		.iter()
		.map(|node| {
			if node.id.name() != query.node_id {
				frontend::node_bar_invisible(node)
			} else if query.visibility {
				frontend::node_bar_open(node)
			} else {
				frontend::node_bar_closed(node)
			}
		})
		.collect();

	return Html(fragments.join("\n")).into_response();
}

//
// MARK: Connect procedure
//

async fn check_response(
	url: &str,
	result: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, ServerError> {
	let response = result.map_err(|source| ServerError::Unreachable {
		url: url.into(),
		source,
	})?;

	let status = response.status();
	if !status.is_success() {
		return Err(ServerError::Rejected {
			url: url.into(),
			status: status.as_u16(),
		});
	}

	return Ok(response);
}

/// Discover downstream pipelines, exchange graph fragments, validate and
/// wire remote edges, connect node servers to their clients, and release
/// the downstream pipelines.
async fn connect(state: &Arc<ServerState>, downstream: &[String]) -> Result<(), ServerError> {
	// 1. pipeline-level connect: announce ourselves, collect graphs
	for base_url in downstream {
		let url = format!("{base_url}/connect");
		let body = PipelineConnectionModel {
			predecessor_host: state.host.clone(),
			predecessor_port: state.port,
		};

		let response = check_response(&url, state.http.post(&url).json(&body).send().await).await?;
		let graph: FrontendGraph =
			response
				.json()
				.await
				.map_err(|source| ServerError::Unreachable {
					url: url.clone(),
					source,
				})?;

		debug!(
			message = "Collected downstream graph",
			name = state.name,
			downstream = base_url,
			nodes = graph.nodes.len(),
		);

		if let Ok(mut models) = state.successor_models.lock() {
			models.push(graph);
		}
	}

	let successor_nodes: Vec<weir_api::pipeline::FrontendNode> = state
		.successor_models
		.lock()
		.map(|models| {
			models
				.iter()
				.flat_map(|g| g.nodes.iter().cloned())
				.collect()
		})
		.unwrap_or_default();

	// 2. register every downstream node with the local metadata store
	if let Some(store) = state.pipeline.metadata_store() {
		for remote in &successor_nodes {
			if !store.node_exists(&remote.node.name).await? {
				store
					.add_node(&remote.node.name, &remote.node.node_type, remote.node.base_type)
					.await?;
			}
		}
	}

	// 3. validate cross-process archetype rules before wiring anything
	for node in state.pipeline.nodes() {
		let base = node.core().base_type();

		for remote_url in node.core().remote_successors() {
			let remote_name = remote_node_name(remote_url);
			let remote = successor_nodes
				.iter()
				.find(|n| n.node.name == remote_name)
				.ok_or_else(|| ServerError::UnknownRemoteNode {
					node: node.core().name().clone(),
					url: remote_url.clone(),
				})?;

			match (base, remote.node.base_type) {
				(BaseType::MetadataStore, BaseType::Resource) => {}
				(BaseType::MetadataStore, _) => {
					return Err(ServerError::InvalidRemoteEdge {
						message: format!(
							"metadata store `{}` cannot connect to non-resource node `{}`",
							node.core().name(),
							remote_name,
						),
					});
				}
				(BaseType::Resource, BaseType::Action) => {}
				(BaseType::Resource, _) => {
					return Err(ServerError::InvalidRemoteEdge {
						message: format!(
							"resource node `{}` cannot connect to non-action node `{}`",
							node.core().name(),
							remote_name,
						),
					});
				}
				(BaseType::Action, _) => {}
			}
		}
	}

	// 4. connector-level connect: register ourselves as each remote
	// successor's predecessor
	for node in state.pipeline.nodes() {
		for remote_url in node.core().remote_successors() {
			let url = format!("{remote_url}/connector/connect");
			let body = NodeConnectionModel {
				node: node.core().model(),
				node_url: node.core().node_url().unwrap_or_default().into(),
				result: None,
			};

			let response =
				check_response(&url, state.http.post(&url).json(&body).send().await).await?;
			let peer: NodeConnectionModel =
				response
					.json()
					.await
					.map_err(|source| ServerError::Unreachable {
						url: url.clone(),
						source,
					})?;

			info!(
				message = "Wired remote edge",
				node = %node.core().name(),
				remote = %peer.node.name,
				remote_url,
			);
		}
	}

	// 5. connect node servers to their configured remote clients
	for node in state.pipeline.nodes() {
		if let Some(client_url) = node.core().client_url() {
			let url = format!("{client_url}/api/client/connect");
			let body = RpcConnectionModel {
				url: format!("{}/{}/api/server", state.origin(), node.core().name()),
			};

			check_response(&url, state.http.post(&url).json(&body).send().await).await?;
			info!(
				message = "Connected node server to remote client",
				node = %node.core().name(),
				client_url,
			);
		}
	}

	// 6. release the downstream pipelines
	for base_url in downstream {
		let url = format!("{base_url}/finish_connect");
		check_response(&url, state.http.post(&url).send().await).await?;
	}

	return Ok(());
}

//
// MARK: Event relay
//

/// Drain the bus and POST every record to the upstream's `/send_event`.
///
/// Delivery failures re-enqueue the record into a bounded pending buffer
/// (oldest dropped first) and mark the upstream disconnected until the
/// next `finish_connect`. Producers are never blocked.
async fn relay_task(state: Arc<ServerState>, shutdown: Arc<Latch>) {
	let mut rx = state.bus.subscribe();
	let mut pending: VecDeque<EventModel> = VecDeque::new();

	loop {
		flush_pending(&state, &mut pending).await;

		tokio::select! {
			_ = shutdown.wait() => break,
			_ = tokio::time::sleep(RELAY_RETRY_PERIOD), if !pending.is_empty() => {}
			received = rx.recv() => match received {
				Ok(event) => {
					if pending.len() >= RELAY_PENDING_CAP {
						pending.pop_front();
					}
					pending.push_back(event);
				}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(message = "Relay lagged behind the bus", skipped);
				}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			}
		}
	}
}

async fn flush_pending(state: &Arc<ServerState>, pending: &mut VecDeque<EventModel>) {
	while let Some(event) = pending.front() {
		if !state.connected.load(Ordering::SeqCst) {
			return;
		}

		let upstream = state.upstream.lock().ok().and_then(|x| x.clone());
		let Some((host, port)) = upstream else {
			return;
		};

		let url = format!("http://{host}:{port}/send_event");
		match state.http.post(&url).json(event).send().await {
			Ok(response) if response.status().is_success() => {
				pending.pop_front();
			}
			Ok(response) => {
				warn!(
					message = "Upstream rejected event; marking disconnected",
					url,
					status = %response.status(),
				);
				state.connected.store(false, Ordering::SeqCst);
				return;
			}
			Err(error) => {
				warn!(
					message = "Could not relay event; marking disconnected",
					url,
					%error,
				);
				state.connected.store(false, Ordering::SeqCst);
				return;
			}
		}
	}
}
