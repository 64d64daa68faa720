//! The metadata-store node: root of a pipeline's local DAG.
//!
//! It owns run ids and the trigger that opens each run. The storage backend
//! behind it is abstract; the core only consumes [`MetadataStore`].

use async_trait::async_trait;
use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicI64, Ordering},
		Arc,
	},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use weir_api::{
	artifact::{ArtifactEntryModel, ArtifactState, MetricModel, NodeRecord, ParamModel, RunModel},
	labels::NodeLabel,
	rpc::{CreateEntryRequest, EntriesQuery, HistoryQuery},
	status::{BaseType, NodeResult, NodeStatus},
};

use super::{Node, NodeCore, NodeOptions, MONITOR_PERIOD};
use crate::{errors::HookError, latch::Latch};

/// An error from a metadata store backend.
#[derive(Debug, Error)]
pub enum MetadataError {
	/// A remote store was called before its connection was established.
	/// Resource monitors suppress this and retry on their next tick.
	#[error("network connection has not been established yet")]
	NotConnected,

	/// The named node is not registered with this store
	#[error("no node named `{0}` is registered with this metadata store")]
	NoSuchNode(NodeLabel),

	/// No entry with this id
	#[error("no artifact entry with id {0}")]
	NoSuchEntry(i64),

	/// An error from the storage backend
	#[error("metadata backend error")]
	Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

	/// An error from the RPC transport
	#[error("metadata rpc error: {0}")]
	Rpc(String),
}

/// The abstract metadata interface the core consumes.
///
/// Implementations must make `add_node`, `create_entry`, `start_run` and
/// `end_run` linearizable per store instance: the handshake assumes one
/// consistent view of run and artifact state.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
	/// One-time backend setup (create schema, directories, ...)
	async fn init(&self) -> Result<(), MetadataError> {
		Ok(())
	}

	async fn add_node(
		&self,
		node_name: &NodeLabel,
		node_type: &str,
		base_type: BaseType,
	) -> Result<(), MetadataError>;

	async fn node_exists(&self, node_name: &NodeLabel) -> Result<bool, MetadataError>;

	async fn get_node_id(&self, node_name: &NodeLabel) -> Result<i64, MetadataError>;

	async fn get_nodes_info(&self) -> Result<Vec<NodeRecord>, MetadataError>;

	/// The id of the active run, or of the next run if none is active.
	async fn get_run_id(&self) -> Result<i64, MetadataError>;

	/// Open a run: record its start time, promote every unassigned `new`
	/// entry to `current` stamped with this run id, and associate pending
	/// triggers with it.
	async fn start_run(&self, run_id: i64) -> Result<(), MetadataError>;

	/// Close a run: record its end time and demote `current` entries
	/// to `old`.
	async fn end_run(&self, run_id: i64) -> Result<(), MetadataError>;

	async fn get_runs(&self) -> Result<Vec<RunModel>, MetadataError>;

	async fn create_entry(&self, entry: CreateEntryRequest) -> Result<(), MetadataError>;

	async fn entry_exists(
		&self,
		resource_node_name: &NodeLabel,
		location: &str,
	) -> Result<bool, MetadataError>;

	async fn update_entry(
		&self,
		resource_node_name: &NodeLabel,
		entry_id: i64,
		state: ArtifactState,
		run_id: Option<i64>,
	) -> Result<(), MetadataError>;

	async fn get_num_entries(
		&self,
		resource_node_name: &NodeLabel,
		state: Option<ArtifactState>,
	) -> Result<i64, MetadataError>;

	async fn get_entries(&self, query: EntriesQuery)
		-> Result<Vec<ArtifactEntryModel>, MetadataError>;

	/// Upsert a batch of entries by `(node, location)`.
	/// Used to seed a store from another pipeline's artifacts table.
	async fn merge_artifacts_table(
		&self,
		resource_node_name: &NodeLabel,
		entries: Vec<ArtifactEntryModel>,
	) -> Result<(), MetadataError>;

	async fn log_metrics(
		&self,
		node_name: &NodeLabel,
		metrics: BTreeMap<String, f64>,
	) -> Result<(), MetadataError>;

	async fn log_params(
		&self,
		node_name: &NodeLabel,
		params: BTreeMap<String, String>,
	) -> Result<(), MetadataError>;

	async fn set_tags(
		&self,
		node_name: &NodeLabel,
		tags: BTreeMap<String, String>,
	) -> Result<(), MetadataError>;

	async fn get_metrics(&self, query: HistoryQuery) -> Result<Vec<MetricModel>, MetadataError>;

	async fn get_params(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError>;

	async fn get_tags(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError>;

	/// Record a trigger. Triggers logged before a run starts and not yet
	/// associated with one are claimed by the next `start_run`.
	async fn log_trigger(
		&self,
		node_name: &NodeLabel,
		message: Option<&str>,
	) -> Result<(), MetadataError>;
}

/// A user-supplied trigger condition for the metadata store's monitor,
/// e.g. "fire when the latest logged accuracy drops below a threshold".
#[async_trait]
pub trait MetadataTrigger: Send + Sync + 'static {
	/// Return true to trigger a run. Checked once per monitor tick.
	async fn check(&self, store: &dyn MetadataStore) -> Result<bool, MetadataError>;
}

/// The root node of a pipeline: opens and closes runs around the
/// handshake with its resource successors.
pub struct MetadataStoreNode {
	core: Arc<NodeCore>,
	store: Arc<dyn MetadataStore>,
	run_id: AtomicI64,
	trigger: Latch,
	custom_trigger: Option<Arc<dyn MetadataTrigger>>,
}

impl MetadataStoreNode {
	pub fn new(
		name: &str,
		node_type: &str,
		store: Arc<dyn MetadataStore>,
		options: NodeOptions,
	) -> Self {
		Self {
			core: Arc::new(NodeCore::new(
				name,
				node_type,
				BaseType::MetadataStore,
				options,
			)),
			store,
			run_id: AtomicI64::new(0),
			trigger: Latch::new(),
			custom_trigger: None,
		}
	}

	/// Replace the default always-fire trigger with a custom condition.
	pub fn with_trigger(mut self, trigger: Arc<dyn MetadataTrigger>) -> Self {
		self.custom_trigger = Some(trigger);
		self
	}

	pub fn store(&self) -> Arc<dyn MetadataStore> {
		self.store.clone()
	}

	pub fn run_id(&self) -> i64 {
		self.run_id.load(Ordering::SeqCst)
	}

	/// Fire the run trigger. The trigger is logged to the store *before*
	/// the latch is set, so `start_run` can associate it with the run
	/// it causes.
	pub async fn trigger(&self, message: Option<&str>) {
		if self.trigger.is_set() {
			return;
		}

		if message.is_some() {
			match self.store.log_trigger(self.core.name(), message).await {
				Ok(()) => {}
				Err(error) => {
					warn!(
						message = "Could not log trigger",
						node = %self.core.name(),
						%error,
					);
				}
			}
		}

		self.trigger.set();
	}

	/// The monitor helper: polls the trigger condition until exit.
	async fn monitor(self: Arc<Self>) {
		debug!(message = "Starting observer task", node = %self.core.name());

		while !self.core.exiting() {
			let fire = match &self.custom_trigger {
				None => true,
				Some(t) => match t.check(&*self.store).await {
					Ok(x) => x,
					Err(error) => {
						warn!(
							message = "Error checking metadata trigger",
							node = %self.core.name(),
							%error,
						);
						false
					}
				},
			};

			if fire {
				self.trigger(None).await;
			}

			if self.core.sleep_or_exit(MONITOR_PERIOD).await {
				break;
			}
		}

		debug!(message = "Observer task exited", node = %self.core.name());
	}
}

#[async_trait]
impl Node for MetadataStoreNode {
	fn core(&self) -> &Arc<NodeCore> {
		&self.core
	}

	async fn setup(&self) -> Result<(), HookError> {
		self.store.init().await?;
		return Ok(());
	}

	fn exit(&self) {
		self.core.exit();
		self.trigger.set();
	}

	fn metadata_store(&self) -> Option<Arc<dyn MetadataStore>> {
		Some(self.store.clone())
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
		self
	}

	async fn run_loop(self: Arc<Self>) {
		let core = self.core.clone();
		let monitor = tokio::spawn(self.clone().monitor());

		core.await_connection().await;

		while !core.exiting() {
			core.wait_if_paused().await;

			// wait for all resource nodes to announce they are ready
			core.set_status(NodeStatus::WaitingSuccessors);
			core.wait_for_successors().await;
			if core.exiting() {
				break;
			}

			// wait for the trigger condition
			core.set_status(NodeStatus::WaitingMetrics);
			self.trigger.wait().await;
			if core.exiting() {
				break;
			}
			self.trigger.clear();
			core.set_status(NodeStatus::Triggered);

			// open the run
			let run_id = self.run_id.load(Ordering::SeqCst);
			info!(message = "Creating run", node = %core.name(), run_id);
			match self.store.start_run(run_id).await {
				Ok(()) => {}
				Err(error) => {
					error!(
						message = "Could not start run, exiting",
						node = %core.name(),
						run_id,
						%error,
					);
					core.set_status(NodeStatus::Error);
					core.exit();
					self.trigger.set();
					break;
				}
			}

			// announce the run to the graph
			core.signal_successors(NodeResult::Success).await;
			if core.exiting() {
				break;
			}

			// wait for everyone to finish with the current state
			core.set_status(NodeStatus::WaitingSuccessors);
			core.wait_for_successors().await;
			if core.exiting() {
				break;
			}

			// close the run
			info!(message = "Ending run", node = %core.name(), run_id);
			match self.store.end_run(run_id).await {
				Ok(()) => {}
				Err(error) => {
					error!(
						message = "Could not end run, exiting",
						node = %core.name(),
						run_id,
						%error,
					);
					core.set_status(NodeStatus::Error);
					core.exit();
					self.trigger.set();
					break;
				}
			}
			self.run_id.fetch_add(1, Ordering::SeqCst);

			// announce the end of the run
			core.signal_successors(NodeResult::Success).await;
		}

		match monitor.await {
			Ok(()) => {}
			Err(error) => {
				warn!(message = "Observer task panicked", node = %core.name(), %error);
			}
		}
	}
}
