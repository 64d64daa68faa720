//! End-to-end tests of the node handshake, run in-process with an
//! in-memory metadata store and a real watched directory.

use async_trait::async_trait;
use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::{Duration, Instant},
};

use weir_api::{
	artifact::ArtifactState,
	labels::NodeLabel,
	rpc::EntriesQuery,
	status::NodeStatus,
};
use weir_metastore::MemoryMetadataStore;
use weir_nodes::FilesystemStore;
use weir_pipeline::{
	errors::HookError,
	node::{
		Action, ActionNode, ArtifactStore, DiscoveredArtifact, MetadataStore, MetadataStoreNode,
		Node, NodeOptions, ResourceNode,
	},
	pipeline::Pipeline,
};

const TICK: Duration = Duration::from_millis(25);
const PATIENCE: Duration = Duration::from_secs(15);

struct CountAction {
	executions: Arc<AtomicUsize>,
}

#[async_trait]
impl Action for CountAction {
	async fn execute(&self) -> Result<bool, HookError> {
		self.executions.fetch_add(1, Ordering::SeqCst);
		return Ok(true);
	}
}

fn options(predecessors: &[&str]) -> NodeOptions {
	NodeOptions {
		predecessors: predecessors.iter().map(|x| NodeLabel::new(x)).collect(),
		..Default::default()
	}
}

async fn eventually<F>(what: &str, mut check: F)
where
	F: FnMut() -> bool,
{
	let deadline = Instant::now() + PATIENCE;
	while Instant::now() < deadline {
		if check() {
			return;
		}
		tokio::time::sleep(TICK).await;
	}
	panic!("timed out waiting for: {what}");
}

/// One trigger produces exactly one (start_run, end_run) pair, and the
/// action executes exactly once per run.
#[tokio::test]
async fn one_run_per_trigger() {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(MemoryMetadataStore::new());
	let executions = Arc::new(AtomicUsize::new(0));

	let meta = Arc::new(MetadataStoreNode::new(
		"meta",
		"MemoryMetadataStore",
		store.clone(),
		NodeOptions::default(),
	));
	let data = Arc::new(ResourceNode::new(
		"data",
		"FilesystemStore",
		Arc::new(FilesystemStore::new(dir.path())),
		store.clone(),
		options(&["meta"]),
	));
	let count = Arc::new(ActionNode::new(
		"count",
		"CountAction",
		Arc::new(CountAction {
			executions: executions.clone(),
		}),
		options(&["data"]),
	));

	let nodes: Vec<Arc<dyn Node>> = vec![meta, data, count];
	let pipeline = Pipeline::new("test", nodes).unwrap();
	pipeline.launch_nodes().await;

	// nothing to do yet
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(executions.load(Ordering::SeqCst), 0);
	assert!(store.get_runs().await.unwrap().is_empty());

	// first artifact appears
	std::fs::write(dir.path().join("f1.txt"), b"first").unwrap();

	{
		let executions = executions.clone();
		eventually("first execution", move || {
			executions.load(Ordering::SeqCst) == 1
		})
		.await;
	}

	// run 0 closes, and the artifact went new -> current -> old
	let deadline = Instant::now() + PATIENCE;
	loop {
		let runs = store.get_runs().await.unwrap();
		if runs.len() == 1 && runs[0].end_time.is_some() {
			break;
		}
		if Instant::now() > deadline {
			panic!("timed out waiting for run 0 to end");
		}
		tokio::time::sleep(TICK).await;
	}

	let entries = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(NodeLabel::new("data")),
			state: None,
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].location, "f1.txt");
	assert_eq!(entries[0].state, ArtifactState::Old);
	assert_eq!(entries[0].run_id, Some(0));
	assert_eq!(entries[0].hash_algorithm.as_deref(), Some("sha256"));

	let runs = store.get_runs().await.unwrap();
	assert_eq!(runs.len(), 1);
	assert!(runs[0].end_time.unwrap() > runs[0].start_time);

	// no further triggers: the action must not run again
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(executions.load(Ordering::SeqCst), 1);
	assert_eq!(store.get_runs().await.unwrap().len(), 1);

	// a second artifact starts exactly one more run
	std::fs::write(dir.path().join("f2.txt"), b"second").unwrap();
	{
		let executions = executions.clone();
		eventually("second execution", move || {
			executions.load(Ordering::SeqCst) == 2
		})
		.await;
	}

	tokio::time::timeout(Duration::from_secs(5), pipeline.terminate_nodes())
		.await
		.unwrap();
}

/// Termination completes in bounded time no matter where the loops are
/// blocked, and every node ends in EXITED.
#[tokio::test]
async fn exit_unblocks_waiting_nodes() {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(MemoryMetadataStore::new());

	let meta = Arc::new(MetadataStoreNode::new(
		"meta",
		"MemoryMetadataStore",
		store.clone(),
		NodeOptions::default(),
	));
	let data = Arc::new(ResourceNode::new(
		"data",
		"FilesystemStore",
		Arc::new(FilesystemStore::new(dir.path())),
		store.clone(),
		options(&["meta"]),
	));
	let act = Arc::new(ActionNode::new(
		"act",
		"CountAction",
		Arc::new(CountAction {
			executions: Arc::new(AtomicUsize::new(0)),
		}),
		options(&["data"]),
	));

	let nodes: Vec<Arc<dyn Node>> = vec![meta, data, act];
	let pipeline = Pipeline::new("idle", nodes).unwrap();
	pipeline.launch_nodes().await;

	// let everything reach its blocking wait: the directory is empty, so
	// the resource never triggers and the action never wakes
	eventually("action to block on its predecessors", || {
		pipeline
			.node("act")
			.map(|n| n.core().status() == NodeStatus::WaitingPredecessors)
			.unwrap_or(false)
	})
	.await;

	tokio::time::timeout(Duration::from_secs(5), pipeline.terminate_nodes())
		.await
		.unwrap();

	for name in ["meta", "data", "act"] {
		let node = pipeline.node(name).unwrap();
		assert_eq!(
			node.core().status(),
			NodeStatus::Exited,
			"node {name} did not exit"
		);
	}
}

//
// MARK: Setup ordering
//

type SetupLog = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

async fn record_setup(log: &SetupLog, name: &str) {
	let start = Instant::now();
	tokio::time::sleep(Duration::from_millis(50)).await;
	if let Ok(mut log) = log.lock() {
		log.push((name.into(), start, Instant::now()));
	}
}

struct TimedArtifacts {
	name: String,
	log: SetupLog,
}

#[async_trait]
impl ArtifactStore for TimedArtifacts {
	async fn init(&self) -> Result<(), HookError> {
		record_setup(&self.log, &self.name).await;
		return Ok(());
	}

	async fn discover(&self) -> Result<Vec<DiscoveredArtifact>, HookError> {
		Ok(Vec::new())
	}

	fn resolve(&self, location: &str) -> std::path::PathBuf {
		location.into()
	}
}

struct TimedAction {
	name: String,
	log: SetupLog,
}

#[async_trait]
impl Action for TimedAction {
	async fn setup(&self) -> Result<(), HookError> {
		record_setup(&self.log, &self.name).await;
		return Ok(());
	}

	async fn execute(&self) -> Result<bool, HookError> {
		Ok(true)
	}
}

struct TimedMeta {
	log: SetupLog,
	inner: MemoryMetadataStore,
}

#[async_trait]
impl weir_pipeline::node::MetadataStore for TimedMeta {
	async fn init(&self) -> Result<(), weir_pipeline::node::MetadataError> {
		record_setup(&self.log, "meta").await;
		return Ok(());
	}

	async fn add_node(
		&self,
		node_name: &NodeLabel,
		node_type: &str,
		base_type: weir_api::status::BaseType,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.add_node(node_name, node_type, base_type).await
	}

	async fn node_exists(
		&self,
		node_name: &NodeLabel,
	) -> Result<bool, weir_pipeline::node::MetadataError> {
		self.inner.node_exists(node_name).await
	}

	async fn get_node_id(
		&self,
		node_name: &NodeLabel,
	) -> Result<i64, weir_pipeline::node::MetadataError> {
		self.inner.get_node_id(node_name).await
	}

	async fn get_nodes_info(
		&self,
	) -> Result<Vec<weir_api::artifact::NodeRecord>, weir_pipeline::node::MetadataError> {
		self.inner.get_nodes_info().await
	}

	async fn get_run_id(&self) -> Result<i64, weir_pipeline::node::MetadataError> {
		self.inner.get_run_id().await
	}

	async fn start_run(&self, run_id: i64) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.start_run(run_id).await
	}

	async fn end_run(&self, run_id: i64) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.end_run(run_id).await
	}

	async fn get_runs(
		&self,
	) -> Result<Vec<weir_api::artifact::RunModel>, weir_pipeline::node::MetadataError> {
		self.inner.get_runs().await
	}

	async fn create_entry(
		&self,
		entry: weir_api::rpc::CreateEntryRequest,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.create_entry(entry).await
	}

	async fn entry_exists(
		&self,
		resource_node_name: &NodeLabel,
		location: &str,
	) -> Result<bool, weir_pipeline::node::MetadataError> {
		self.inner.entry_exists(resource_node_name, location).await
	}

	async fn update_entry(
		&self,
		resource_node_name: &NodeLabel,
		entry_id: i64,
		state: ArtifactState,
		run_id: Option<i64>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner
			.update_entry(resource_node_name, entry_id, state, run_id)
			.await
	}

	async fn get_num_entries(
		&self,
		resource_node_name: &NodeLabel,
		state: Option<ArtifactState>,
	) -> Result<i64, weir_pipeline::node::MetadataError> {
		self.inner.get_num_entries(resource_node_name, state).await
	}

	async fn get_entries(
		&self,
		query: EntriesQuery,
	) -> Result<Vec<weir_api::artifact::ArtifactEntryModel>, weir_pipeline::node::MetadataError> {
		self.inner.get_entries(query).await
	}

	async fn merge_artifacts_table(
		&self,
		resource_node_name: &NodeLabel,
		entries: Vec<weir_api::artifact::ArtifactEntryModel>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner
			.merge_artifacts_table(resource_node_name, entries)
			.await
	}

	async fn log_metrics(
		&self,
		node_name: &NodeLabel,
		metrics: std::collections::BTreeMap<String, f64>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.log_metrics(node_name, metrics).await
	}

	async fn log_params(
		&self,
		node_name: &NodeLabel,
		params: std::collections::BTreeMap<String, String>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.log_params(node_name, params).await
	}

	async fn set_tags(
		&self,
		node_name: &NodeLabel,
		tags: std::collections::BTreeMap<String, String>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.set_tags(node_name, tags).await
	}

	async fn get_metrics(
		&self,
		query: weir_api::rpc::HistoryQuery,
	) -> Result<Vec<weir_api::artifact::MetricModel>, weir_pipeline::node::MetadataError> {
		self.inner.get_metrics(query).await
	}

	async fn get_params(
		&self,
		query: weir_api::rpc::HistoryQuery,
	) -> Result<Vec<weir_api::artifact::ParamModel>, weir_pipeline::node::MetadataError> {
		self.inner.get_params(query).await
	}

	async fn get_tags(
		&self,
		query: weir_api::rpc::HistoryQuery,
	) -> Result<Vec<weir_api::artifact::ParamModel>, weir_pipeline::node::MetadataError> {
		self.inner.get_tags(query).await
	}

	async fn log_trigger(
		&self,
		node_name: &NodeLabel,
		message: Option<&str>,
	) -> Result<(), weir_pipeline::node::MetadataError> {
		self.inner.log_trigger(node_name, message).await
	}
}

/// Setup runs in archetype waves: the metadata store finishes before any
/// resource starts, and every resource finishes before any action starts.
/// Nodes within one wave set up concurrently.
#[tokio::test]
async fn setup_runs_in_archetype_waves() {
	let log: SetupLog = Arc::new(Mutex::new(Vec::new()));

	let store = Arc::new(TimedMeta {
		log: log.clone(),
		inner: MemoryMetadataStore::new(),
	});

	let meta = Arc::new(MetadataStoreNode::new(
		"meta",
		"TimedMeta",
		store.clone(),
		NodeOptions::default(),
	));

	let mut nodes: Vec<Arc<dyn Node>> = vec![meta];
	for i in 0..3 {
		nodes.push(Arc::new(ResourceNode::new(
			&format!("r{i}"),
			"TimedArtifacts",
			Arc::new(TimedArtifacts {
				name: format!("r{i}"),
				log: log.clone(),
			}),
			store.clone(),
			options(&["meta"]),
		)));
	}
	for i in 0..3 {
		nodes.push(Arc::new(ActionNode::new(
			&format!("a{i}"),
			"TimedAction",
			Arc::new(TimedAction {
				name: format!("a{i}"),
				log: log.clone(),
			}),
			options(&[&format!("r{i}")]),
		)));
	}

	let pipeline = Pipeline::new("waves", nodes).unwrap();
	pipeline.setup_nodes().await;

	let log = log.lock().unwrap();
	assert_eq!(log.len(), 7);

	let end_of = |prefix: &str| {
		log.iter()
			.filter(|(n, _, _)| n.starts_with(prefix))
			.map(|(_, _, end)| *end)
			.max()
			.unwrap()
	};
	let start_of = |prefix: &str| {
		log.iter()
			.filter(|(n, _, _)| n.starts_with(prefix))
			.map(|(_, start, _)| *start)
			.min()
			.unwrap()
	};

	assert!(end_of("meta") <= start_of("r"));
	assert!(end_of("r") <= start_of("a"));

	// and every node is registered once the waves are done
	for name in ["meta", "r0", "r1", "r2", "a0", "a1", "a2"] {
		assert!(store.inner.node_exists(&NodeLabel::new(name)).await.unwrap());
	}
}
