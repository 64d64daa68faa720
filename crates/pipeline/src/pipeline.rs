//! Pipeline topology: building, validating, and running a DAG of nodes.

use petgraph::{algo::toposort, graph::DiGraph, Direction};
use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weir_api::{
	labels::{NodeLabel, PipelineName},
	pipeline::PipelineModel,
	status::{BaseType, NodeStatus},
};
use weir_util::names::check_name;

use crate::{
	errors::PipelineError,
	events::EventBus,
	node::{MetadataStore, Node},
};

/// A validated DAG of nodes and the machinery to run it.
///
/// Construction performs every local-graph check; a `Pipeline` value is
/// guaranteed to be a DAG that satisfies the archetype adjacency rules.
/// Cross-process edges are validated later, at connect time.
pub struct Pipeline {
	name: PipelineName,

	/// All nodes, in topological order
	nodes: Vec<Arc<dyn Node>>,

	/// All local edges, source to target
	edges: Vec<(NodeLabel, NodeLabel)>,

	/// Nodes whose setup failed; their loops are skipped
	failed_setup: Mutex<BTreeSet<NodeLabel>>,

	/// Join handles of running node loops
	handles: tokio::sync::Mutex<BTreeMap<NodeLabel, JoinHandle<()>>>,
}

impl Pipeline {
	/// Build and validate a pipeline from a set of nodes.
	/// Local edges are derived from each node's predecessor names.
	pub fn new(name: &str, nodes: Vec<Arc<dyn Node>>) -> Result<Self, PipelineError> {
		debug!(message = "Building pipeline", name);

		// Check names before using them as keys anywhere
		let mut seen: BTreeSet<&str> = BTreeSet::new();
		for node in &nodes {
			let label = node.core().name();
			match check_name(label.name()) {
				Ok(()) => {}
				Err(source) => {
					return Err(PipelineError::InvalidName {
						node: label.clone(),
						source,
					})
				}
			}

			if !seen.insert(label.name()) {
				return Err(PipelineError::DuplicateNode {
					name: label.clone(),
				});
			}
		}

		// Build the graph. Nodes hold only names; all adjacency lives here.
		let mut graph: DiGraph<NodeLabel, ()> = DiGraph::new();
		let mut indices = BTreeMap::new();
		for node in &nodes {
			let label = node.core().name().clone();
			let idx = graph.add_node(label.clone());
			indices.insert(label, idx);
		}

		let mut edges = Vec::new();
		for node in &nodes {
			let target = node.core().name();
			for predecessor in node.core().predecessors() {
				let source = match indices.get(predecessor) {
					Some(x) => *x,
					None => {
						return Err(PipelineError::UnknownPredecessor {
							node: target.clone(),
							predecessor: predecessor.clone(),
						})
					}
				};

				graph.add_edge(source, indices[target], ());
				edges.push((predecessor.clone(), target.clone()));
			}
		}

		let order = match toposort(&graph, None) {
			Ok(x) => x,
			Err(_) => return Err(PipelineError::NotADag),
		};

		// Archetype adjacency rules
		let by_name: BTreeMap<&NodeLabel, &Arc<dyn Node>> =
			nodes.iter().map(|n| (n.core().name(), n)).collect();

		let mut n_metadata_stores = 0usize;
		for node in &nodes {
			let base = node.core().base_type();
			if base == BaseType::MetadataStore {
				n_metadata_stores += 1;
			}

			for succ_idx in graph.neighbors_directed(indices[node.core().name()], Direction::Outgoing)
			{
				let successor = &graph[succ_idx];
				let succ_base = by_name[successor].core().base_type();

				match base {
					BaseType::MetadataStore => {
						if succ_base != BaseType::Resource {
							return Err(PipelineError::MetadataSuccessorNotResource {
								store: node.core().name().clone(),
								successor: successor.clone(),
							});
						}
					}
					BaseType::Resource => {
						if succ_base != BaseType::Action {
							return Err(PipelineError::ResourceSuccessorNotAction {
								resource: node.core().name().clone(),
								successor: successor.clone(),
							});
						}
					}
					BaseType::Action => {}
				}
			}
		}

		if n_metadata_stores > 1 {
			return Err(PipelineError::MultipleMetadataStores);
		}

		// Wire the latches for every local edge
		for (source, target) in &edges {
			by_name[source]
				.core()
				.wire_local_successor(by_name[target].core());
		}

		// Keep nodes in topological order from here on
		let ordered: Vec<Arc<dyn Node>> = order
			.iter()
			.map(|idx| Arc::clone(by_name[&graph[*idx]]))
			.collect();

		return Ok(Self {
			name: PipelineName::new(name),
			nodes: ordered,
			edges,
			failed_setup: Mutex::new(BTreeSet::new()),
			handles: tokio::sync::Mutex::new(BTreeMap::new()),
		});
	}

	pub fn name(&self) -> &PipelineName {
		&self.name
	}

	/// All nodes, in topological order.
	pub fn nodes(&self) -> &[Arc<dyn Node>] {
		&self.nodes
	}

	pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
		self.nodes.iter().find(|n| n.core().name().name() == name)
	}

	pub fn edges(&self) -> &[(NodeLabel, NodeLabel)] {
		&self.edges
	}

	/// This pipeline's local graph fragment, for advertisement to peers.
	pub fn model(&self) -> PipelineModel {
		PipelineModel {
			nodes: self.nodes.iter().map(|n| n.core().model()).collect(),
			edges: self.edges.clone(),
		}
	}

	/// The metadata store node of this pipeline, if it has one.
	pub fn metadata_store_node(&self) -> Option<&Arc<dyn Node>> {
		self.nodes
			.iter()
			.find(|n| n.core().base_type() == BaseType::MetadataStore)
	}

	/// The metadata store backend of this pipeline, if it has one.
	pub fn metadata_store(&self) -> Option<Arc<dyn MetadataStore>> {
		self.metadata_store_node().and_then(|n| n.metadata_store())
	}

	/// Attach an event bus to every node.
	pub fn attach_events(&self, bus: &EventBus) {
		for node in &self.nodes {
			node.core().attach_events(bus.clone());
		}
	}

	/// Run every node's `setup()`, one archetype wave at a time:
	/// the metadata store first, then resources, then actions. Setup runs
	/// concurrently within a wave; a wave finishes before the next starts.
	pub async fn setup_nodes(&self) {
		for wave in [BaseType::MetadataStore, BaseType::Resource, BaseType::Action] {
			let wave_nodes: Vec<Arc<dyn Node>> = self
				.nodes
				.iter()
				.filter(|n| n.core().base_type() == wave)
				.cloned()
				.collect();

			let mut tasks = Vec::new();
			for node in wave_nodes {
				node.core().set_status(NodeStatus::Initializing);
				info!(message = "Starting setup phase", node = %node.core().name());

				tasks.push(tokio::spawn(async move {
					let name = node.core().name().clone();
					let result = node.setup().await;
					(name, node, result)
				}));
			}

			for task in tasks {
				match task.await {
					Ok((name, _, Ok(()))) => {
						info!(message = "Finished setup phase", node = %name);
					}
					Ok((name, node, Err(error))) => {
						warn!(
							message = "Setup failed; this node will not run",
							node = %name,
							%error,
						);
						node.core().set_status(NodeStatus::Error);
						if let Ok(mut failed) = self.failed_setup.lock() {
							failed.insert(name);
						}
					}
					Err(error) => {
						// The setup task itself died; we cannot know which
						// node it was from the handle alone, so this is
						// logged and the panicking node stays OFF.
						warn!(message = "Setup task panicked", %error);
					}
				}
			}
		}

		// Register every local node with the metadata store
		if let Some(store) = self.metadata_store() {
			for node in &self.nodes {
				let core = node.core();
				match store
					.add_node(core.name(), core.node_type(), core.base_type())
					.await
				{
					Ok(()) => {}
					Err(error) => {
						warn!(
							message = "Could not register node with metadata store",
							node = %core.name(),
							%error,
						);
					}
				}
			}
		}
	}

	/// Set up every node, then start their run loops.
	pub async fn launch_nodes(&self) {
		self.setup_nodes().await;

		let failed = self
			.failed_setup
			.lock()
			.map(|x| x.clone())
			.unwrap_or_default();

		let mut handles = self.handles.lock().await;
		for node in &self.nodes {
			let name = node.core().name().clone();
			if failed.contains(&name) {
				continue;
			}

			let node = node.clone();
			let handle = tokio::spawn(async move {
				let core = node.core().clone();
				node.run_loop().await;
				core.set_status(NodeStatus::Exited);
			});

			handles.insert(name, handle);
		}
	}

	/// Stop every node, in reverse topological order.
	///
	/// Reverse order matters: successors keep listening for signals from
	/// their predecessors, so downstream waiters must unblock before their
	/// upstreams disappear.
	pub async fn terminate_nodes(&self) {
		info!(message = "Terminating nodes", pipeline = %self.name);

		for node in self.nodes.iter().rev() {
			node.exit();

			let handle = self.handles.lock().await.remove(node.core().name());
			if let Some(handle) = handle {
				match handle.await {
					Ok(()) => {}
					Err(error) => {
						warn!(
							message = "Node loop panicked",
							node = %node.core().name(),
							%error,
						);
					}
				}
			}
		}

		info!(message = "All nodes terminated", pipeline = %self.name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::node::{
		Action, ActionNode, ArtifactStore, DiscoveredArtifact, MetadataError, MetadataStoreNode,
		NodeOptions, ResourceNode,
	};
	use async_trait::async_trait;
	use std::collections::BTreeMap as Map;
	use weir_api::{
		artifact::{ArtifactEntryModel, ArtifactState, MetricModel, NodeRecord, ParamModel, RunModel},
		rpc::{CreateEntryRequest, EntriesQuery, HistoryQuery},
	};

	struct NullStore;

	#[async_trait]
	impl crate::node::MetadataStore for NullStore {
		async fn add_node(
			&self,
			_: &NodeLabel,
			_: &str,
			_: BaseType,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn node_exists(&self, _: &NodeLabel) -> Result<bool, MetadataError> {
			Ok(false)
		}
		async fn get_node_id(&self, _: &NodeLabel) -> Result<i64, MetadataError> {
			Ok(0)
		}
		async fn get_nodes_info(&self) -> Result<Vec<NodeRecord>, MetadataError> {
			Ok(Vec::new())
		}
		async fn get_run_id(&self) -> Result<i64, MetadataError> {
			Ok(0)
		}
		async fn start_run(&self, _: i64) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn end_run(&self, _: i64) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn get_runs(&self) -> Result<Vec<RunModel>, MetadataError> {
			Ok(Vec::new())
		}
		async fn create_entry(&self, _: CreateEntryRequest) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn entry_exists(&self, _: &NodeLabel, _: &str) -> Result<bool, MetadataError> {
			Ok(false)
		}
		async fn update_entry(
			&self,
			_: &NodeLabel,
			_: i64,
			_: ArtifactState,
			_: Option<i64>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn get_num_entries(
			&self,
			_: &NodeLabel,
			_: Option<ArtifactState>,
		) -> Result<i64, MetadataError> {
			Ok(0)
		}
		async fn get_entries(
			&self,
			_: EntriesQuery,
		) -> Result<Vec<ArtifactEntryModel>, MetadataError> {
			Ok(Vec::new())
		}
		async fn merge_artifacts_table(
			&self,
			_: &NodeLabel,
			_: Vec<ArtifactEntryModel>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn log_metrics(
			&self,
			_: &NodeLabel,
			_: Map<String, f64>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn log_params(
			&self,
			_: &NodeLabel,
			_: Map<String, String>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn set_tags(
			&self,
			_: &NodeLabel,
			_: Map<String, String>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
		async fn get_metrics(&self, _: HistoryQuery) -> Result<Vec<MetricModel>, MetadataError> {
			Ok(Vec::new())
		}
		async fn get_params(&self, _: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
			Ok(Vec::new())
		}
		async fn get_tags(&self, _: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
			Ok(Vec::new())
		}
		async fn log_trigger(
			&self,
			_: &NodeLabel,
			_: Option<&str>,
		) -> Result<(), MetadataError> {
			Ok(())
		}
	}

	struct NullArtifacts;

	#[async_trait]
	impl ArtifactStore for NullArtifacts {
		async fn discover(&self) -> Result<Vec<DiscoveredArtifact>, crate::errors::HookError> {
			Ok(Vec::new())
		}
		fn resolve(&self, location: &str) -> std::path::PathBuf {
			location.into()
		}
	}

	struct Noop;

	#[async_trait]
	impl Action for Noop {
		async fn execute(&self) -> Result<bool, crate::errors::HookError> {
			Ok(true)
		}
	}

	fn action(name: &str, predecessors: &[&str]) -> Arc<dyn Node> {
		Arc::new(ActionNode::new(
			name,
			"Noop",
			Arc::new(Noop),
			NodeOptions {
				predecessors: predecessors.iter().map(|x| NodeLabel::new(x)).collect(),
				..Default::default()
			},
		))
	}

	fn metadata(name: &str) -> Arc<dyn Node> {
		Arc::new(MetadataStoreNode::new(
			name,
			"NullStore",
			Arc::new(NullStore),
			NodeOptions::default(),
		))
	}

	fn resource(name: &str, predecessors: &[&str]) -> Arc<dyn Node> {
		Arc::new(ResourceNode::new(
			name,
			"NullArtifacts",
			Arc::new(NullArtifacts),
			Arc::new(NullStore),
			NodeOptions {
				predecessors: predecessors.iter().map(|x| NodeLabel::new(x)).collect(),
				..Default::default()
			},
		))
	}

	#[test]
	fn rejects_cycles() {
		let a = action("a", &["b"]);
		let b = action("b", &["a"]);

		match Pipeline::new("cyclic", vec![a, b]) {
			Err(PipelineError::NotADag) => {}
			other => panic!("expected NotADag, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_duplicate_names() {
		let a = action("a", &[]);
		let b = action("a", &[]);

		match Pipeline::new("dup", vec![a, b]) {
			Err(PipelineError::DuplicateNode { .. }) => {}
			other => panic!("expected DuplicateNode, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_dangling_predecessors() {
		let a = action("a", &["ghost"]);

		match Pipeline::new("dangling", vec![a]) {
			Err(PipelineError::UnknownPredecessor { predecessor, .. }) => {
				assert_eq!(predecessor.name(), "ghost");
			}
			other => panic!("expected UnknownPredecessor, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_metadata_to_action_edges() {
		let ms = metadata("ms");
		let a = action("a", &["ms"]);

		match Pipeline::new("bad", vec![ms, a]) {
			Err(PipelineError::MetadataSuccessorNotResource { .. }) => {}
			other => panic!("expected archetype error, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_resource_to_resource_edges() {
		let ms = metadata("ms");
		let r1 = resource("r1", &["ms"]);
		let r2 = resource("r2", &["r1"]);

		match Pipeline::new("bad", vec![ms, r1, r2]) {
			Err(PipelineError::ResourceSuccessorNotAction { .. }) => {}
			other => panic!("expected archetype error, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_two_metadata_stores() {
		let m1 = metadata("m1");
		let m2 = metadata("m2");

		match Pipeline::new("bad", vec![m1, m2]) {
			Err(PipelineError::MultipleMetadataStores) => {}
			other => panic!("expected MultipleMetadataStores, got {:?}", other.err()),
		}
	}

	#[test]
	fn accepts_a_valid_graph_in_topological_order() {
		let ms = metadata("ms");
		let r = resource("r", &["ms"]);
		let a = action("a", &["r"]);

		// deliberately out of order
		let pipeline = Pipeline::new("good", vec![a, ms, r]).unwrap();

		let order: Vec<&str> = pipeline
			.nodes()
			.iter()
			.map(|n| n.core().name().name())
			.collect();
		assert_eq!(order, vec!["ms", "r", "a"]);

		let model = pipeline.model();
		assert_eq!(model.nodes.len(), 3);
		assert_eq!(model.edges.len(), 2);

		// local edges are wired into the models
		let ms_model = model.nodes.iter().find(|n| n.name.name() == "ms").unwrap();
		assert_eq!(ms_model.successors, vec![NodeLabel::new("r")]);
	}
}
