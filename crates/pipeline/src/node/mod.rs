//! The generic node machinery: shared state, latch maps, signalling,
//! suspension and exit. The three archetype loops live in the submodules.

use async_trait::async_trait;
use std::{
	any::Any,
	collections::BTreeMap,
	sync::{Arc, Mutex, OnceLock, RwLock},
	time::Duration,
};
use tracing::{debug, error, warn};

use weir_api::{
	labels::NodeLabel,
	node::{NodeConnectionModel, NodeModel},
	status::{BaseType, NodeResult, NodeStatus},
};

use crate::{errors::HookError, events::EventBus, latch::Latch};

pub mod action;
pub mod metadata;
pub mod resource;

pub use action::{Action, ActionNode};
pub use metadata::{MetadataError, MetadataStore, MetadataStoreNode, MetadataTrigger};
pub use resource::{ArtifactStore, DiscoveredArtifact, ResourceNode, ResourceTrigger};

/// How often monitor helpers poll their trigger condition.
pub const MONITOR_PERIOD: Duration = Duration::from_millis(100);

/// Optional wiring for a new node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
	/// Names of this node's local predecessors.
	/// Every name must belong to a node registered with the same pipeline.
	pub predecessors: Vec<NodeLabel>,

	/// Connector URLs of remote predecessors known ahead of time.
	/// Usually left empty; upstream servers register themselves
	/// through `/connector/connect`.
	pub remote_predecessors: Vec<String>,

	/// Connector URLs of remote successors, e.g. `http://leaf:8001/eval`.
	pub remote_successors: Vec<String>,

	/// Block this node's loop until an upstream pipeline finishes
	/// its connect procedure.
	pub wait_for_connection: bool,

	/// URL of a remote RPC client this node's server should announce
	/// itself to at connect time.
	pub client_url: Option<String>,
}

/// State shared by every node archetype.
///
/// A `NodeCore` holds no references to other nodes: edges are represented
/// by shared [`Latch`]es, cloned into both endpoints when the pipeline is
/// built. That keeps the graph free of ownership cycles and makes
/// termination ordering trivial.
pub struct NodeCore {
	name: NodeLabel,
	node_type: String,
	base_type: BaseType,

	predecessors: Vec<NodeLabel>,
	successors: RwLock<Vec<NodeLabel>>,
	remote_predecessors: RwLock<Vec<String>>,
	remote_successors: Vec<String>,

	/// Latches we wait on in `wait_for_predecessors`,
	/// keyed by predecessor name or remote URL.
	predecessor_latches: RwLock<BTreeMap<String, Arc<Latch>>>,

	/// Latches we wait on in `wait_for_successors`,
	/// keyed by successor name or remote URL.
	successor_latches: RwLock<BTreeMap<String, Arc<Latch>>>,

	/// Local successors' predecessor-latches, set by `signal_successors`
	forward_targets: RwLock<Vec<(NodeLabel, Arc<Latch>)>>,

	/// Local predecessors' successor-latches, set by `signal_predecessors`
	backward_targets: RwLock<Vec<(NodeLabel, Arc<Latch>)>>,

	status: Mutex<NodeStatus>,
	events: OnceLock<EventBus>,

	/// Where this node's connector is mounted, set by the pipeline server
	node_url: OnceLock<String>,

	exit: Latch,
	/// Set while the node is allowed to run; cleared by `pause()`
	pause: Latch,
	connection: Latch,
	wait_for_connection: bool,
	client_url: Option<String>,

	http: reqwest::Client,
}

impl NodeCore {
	pub fn new(name: &str, node_type: &str, base_type: BaseType, options: NodeOptions) -> Self {
		let mut predecessor_latches = BTreeMap::new();
		for url in &options.remote_predecessors {
			predecessor_latches.insert(url.clone(), Arc::new(Latch::new()));
		}

		// Remote successors acknowledge through our connector, so their
		// backward latches exist from the start.
		let mut successor_latches = BTreeMap::new();
		for url in &options.remote_successors {
			successor_latches.insert(url.clone(), Arc::new(Latch::new()));
		}

		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.unwrap_or_else(|_| reqwest::Client::new());

		Self {
			name: NodeLabel::new(name),
			node_type: node_type.into(),
			base_type,
			predecessors: options.predecessors,
			successors: RwLock::new(Vec::new()),
			remote_predecessors: RwLock::new(options.remote_predecessors),
			remote_successors: options.remote_successors,
			predecessor_latches: RwLock::new(predecessor_latches),
			successor_latches: RwLock::new(successor_latches),
			forward_targets: RwLock::new(Vec::new()),
			backward_targets: RwLock::new(Vec::new()),
			status: Mutex::new(NodeStatus::Off),
			events: OnceLock::new(),
			node_url: OnceLock::new(),
			exit: Latch::new(),
			pause: Latch::new_set(),
			connection: Latch::new(),
			wait_for_connection: options.wait_for_connection,
			client_url: options.client_url,
			http,
		}
	}

	//
	// MARK: Identity
	//

	pub fn name(&self) -> &NodeLabel {
		&self.name
	}

	pub fn node_type(&self) -> &str {
		&self.node_type
	}

	pub fn base_type(&self) -> BaseType {
		self.base_type
	}

	pub fn predecessors(&self) -> &[NodeLabel] {
		&self.predecessors
	}

	pub fn remote_successors(&self) -> &[String] {
		&self.remote_successors
	}

	pub fn remote_predecessors(&self) -> Vec<String> {
		self.remote_predecessors
			.read()
			.map(|x| x.clone())
			.unwrap_or_default()
	}

	pub fn client_url(&self) -> Option<&str> {
		self.client_url.as_deref()
	}

	/// Record where this node's connector is mounted.
	/// Called once by the pipeline server; later calls are ignored.
	pub fn set_node_url(&self, url: String) {
		let _ = self.node_url.set(url);
	}

	pub fn node_url(&self) -> Option<&str> {
		self.node_url.get().map(|x| x.as_str())
	}

	pub fn model(&self) -> NodeModel {
		NodeModel {
			name: self.name.clone(),
			node_type: self.node_type.clone(),
			base_type: self.base_type,
			predecessors: self.predecessors.clone(),
			successors: self.successors.read().map(|x| x.clone()).unwrap_or_default(),
		}
	}

	fn connection_model(&self, result: Option<NodeResult>) -> NodeConnectionModel {
		NodeConnectionModel {
			node: self.model(),
			node_url: self.node_url().unwrap_or_default().into(),
			result,
		}
	}

	//
	// MARK: Status
	//

	/// Write this node's status and announce it on the event bus.
	pub fn set_status(&self, status: NodeStatus) {
		if let Ok(mut s) = self.status.lock() {
			*s = status;
		}

		if let Some(bus) = self.events.get() {
			bus.push_status(&self.name, status);
		}
	}

	pub fn status(&self) -> NodeStatus {
		self.status.lock().map(|s| *s).unwrap_or(NodeStatus::Error)
	}

	/// Attach the pipeline's event bus.
	/// Status writes before this point are not announced.
	pub fn attach_events(&self, bus: EventBus) {
		let _ = self.events.set(bus);
	}

	//
	// MARK: Signalling
	//

	/// Announce to every successor, local and remote, that this node has
	/// finished its current step. A remote POST that fails takes this node
	/// down: the handshake is broken and the graph cannot make progress.
	pub async fn signal_successors(&self, result: NodeResult) {
		if let Ok(targets) = self.forward_targets.read() {
			for (_, latch) in targets.iter() {
				latch.set();
			}
		}

		self.signal_remote(&self.remote_successors, "forward_signal", result)
			.await;
	}

	/// The backward half of [`Self::signal_successors`].
	pub async fn signal_predecessors(&self, result: NodeResult) {
		if let Ok(targets) = self.backward_targets.read() {
			for (_, latch) in targets.iter() {
				latch.set();
			}
		}

		let urls = self.remote_predecessors();
		self.signal_remote(&urls, "backward_signal", result).await;
	}

	async fn signal_remote(&self, urls: &[String], endpoint: &str, result: NodeResult) {
		if urls.is_empty() {
			return;
		}

		let body = self.connection_model(Some(result));

		let posts = urls.iter().map(|url| {
			let send = self
				.http
				.post(format!("{url}/connector/{endpoint}"))
				.json(&body)
				.send();
			async move { (url, send.await) }
		});

		for (url, response) in futures::future::join_all(posts).await {
			match response {
				Ok(x) if x.status().is_success() => {}
				Ok(x) => {
					warn!(
						message = "Remote signal was rejected",
						node = %self.name,
						url,
						status = %x.status(),
					);
				}
				Err(error) => {
					error!(
						message = "Failed to deliver remote signal, exiting",
						node = %self.name,
						url,
						%error,
					);
					self.exit();
					return;
				}
			}
		}
	}

	/// Block until every predecessor, local and remote, has signalled once
	/// since the last clear.
	pub async fn wait_for_predecessors(&self) {
		let latches: Vec<Arc<Latch>> = self
			.predecessor_latches
			.read()
			.map(|x| x.values().cloned().collect())
			.unwrap_or_default();

		for latch in &latches {
			latch.wait().await;
		}

		// exit() set these to unblock us; leave them set so any
		// wait the loop reaches before its exit check falls through.
		if self.exit.is_set() {
			return;
		}

		for latch in &latches {
			latch.clear();
		}
	}

	/// Symmetric to [`Self::wait_for_predecessors`].
	pub async fn wait_for_successors(&self) {
		let latches: Vec<Arc<Latch>> = self
			.successor_latches
			.read()
			.map(|x| x.values().cloned().collect())
			.unwrap_or_default();

		for latch in &latches {
			latch.wait().await;
		}

		if self.exit.is_set() {
			return;
		}

		for latch in &latches {
			latch.clear();
		}
	}

	//
	// MARK: Remote edges
	//

	/// Register a remote predecessor and create its latch.
	/// Called by the connector when an upstream node connects.
	pub fn add_remote_predecessor(&self, url: &str) {
		if let Ok(mut remotes) = self.remote_predecessors.write() {
			if !remotes.iter().any(|x| x == url) {
				remotes.push(url.into());
			}
		}

		if let Ok(mut latches) = self.predecessor_latches.write() {
			latches
				.entry(url.into())
				.or_insert_with(|| Arc::new(Latch::new()));
		}
	}

	/// Set the predecessor latch with the given key.
	/// Returns false if no such latch exists.
	pub fn set_predecessor_latch(&self, key: &str) -> bool {
		match self.predecessor_latches.read() {
			Ok(latches) => match latches.get(key) {
				Some(latch) => {
					latch.set();
					true
				}
				None => false,
			},
			Err(_) => false,
		}
	}

	/// Set the successor latch with the given key.
	/// Returns false if no such latch exists.
	pub fn set_successor_latch(&self, key: &str) -> bool {
		match self.successor_latches.read() {
			Ok(latches) => match latches.get(key) {
				Some(latch) => {
					latch.set();
					true
				}
				None => false,
			},
			Err(_) => false,
		}
	}

	//
	// MARK: Life cycle
	//

	/// Ask this node to stop, releasing every latch so blocked waits fall
	/// through to their exit checks. Idempotent.
	pub fn exit(&self) {
		debug!(message = "Node exiting", node = %self.name);

		self.connection.set();
		self.pause.set();
		self.exit.set();

		if let Ok(latches) = self.successor_latches.read() {
			for latch in latches.values() {
				latch.set();
			}
		}

		if let Ok(latches) = self.predecessor_latches.read() {
			for latch in latches.values() {
				latch.set();
			}
		}
	}

	/// Has this node been asked to stop?
	pub fn exiting(&self) -> bool {
		self.exit.is_set()
	}

	pub fn pause(&self) {
		self.set_status(NodeStatus::Paused);
		self.pause.clear();
	}

	pub fn resume(&self) {
		self.pause.set();
	}

	/// Block while paused. Exit also releases this.
	pub async fn wait_if_paused(&self) {
		self.pause.wait().await;
	}

	/// Mark the upstream connection procedure complete.
	pub fn set_connected(&self) {
		self.connection.set();
	}

	pub fn wants_connection(&self) -> bool {
		self.wait_for_connection
	}

	/// Block until an upstream pipeline finishes connecting, if this node
	/// was configured to wait for one.
	pub async fn await_connection(&self) {
		if !self.wait_for_connection {
			return;
		}

		debug!(
			message = "Waiting for upstream pipeline to connect",
			node = %self.name,
		);
		self.connection.wait().await;
	}

	/// Sleep for one monitor tick, or less if the node is asked to exit.
	/// Returns true if the node is exiting.
	pub async fn sleep_or_exit(&self, period: Duration) -> bool {
		tokio::select! {
			_ = tokio::time::sleep(period) => self.exit.is_set(),
			_ = self.exit.wait() => true,
		}
	}

	//
	// MARK: Pipeline wiring
	//

	/// Wire a local edge `self -> successor`, creating the forward and
	/// backward latches both endpoints share.
	pub(crate) fn wire_local_successor(&self, successor: &NodeCore) {
		let forward = Arc::new(Latch::new());
		if let Ok(mut latches) = successor.predecessor_latches.write() {
			latches.insert(self.name.to_string(), forward.clone());
		}
		if let Ok(mut targets) = self.forward_targets.write() {
			targets.push((successor.name.clone(), forward));
		}

		let backward = Arc::new(Latch::new());
		if let Ok(mut latches) = self.successor_latches.write() {
			latches.insert(successor.name.to_string(), backward.clone());
		}
		if let Ok(mut targets) = successor.backward_targets.write() {
			targets.push((self.name.clone(), backward));
		}

		if let Ok(mut successors) = self.successors.write() {
			successors.push(successor.name.clone());
		}
	}
}

/// One node in a pipeline.
///
/// The archetype (metadata store, resource, action) fixes the shape of
/// `run_loop`; concrete behavior is supplied through the archetype's own
/// seam ([`MetadataStore`], [`ArtifactStore`], [`Action`]).
#[async_trait]
pub trait Node: Send + Sync + 'static {
	fn core(&self) -> &Arc<NodeCore>;

	/// One-time setup, run in its own task before the loop starts.
	/// An error here puts the node in ERROR and skips its loop.
	async fn setup(&self) -> Result<(), HookError> {
		Ok(())
	}

	/// The archetype-defined run loop. Returns when the node exits.
	async fn run_loop(self: Arc<Self>);

	/// Ask this node to stop. Archetypes with extra latches override this
	/// to release them too.
	fn exit(&self) {
		self.core().exit();
	}

	/// The metadata store backing this node, if it is a metadata store node.
	fn metadata_store(&self) -> Option<Arc<dyn MetadataStore>> {
		None
	}

	fn as_any(&self) -> &dyn Any;

	/// This node as a shareable `Any`, so hosting code can recover the
	/// concrete archetype behind an `Arc<dyn Node>`.
	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
