//! An in-memory metadata store.
//!
//! Same contract as the SQLite store, no file on disk. Useful for tests
//! and for pipelines whose bookkeeping does not need to survive the
//! process.

use async_trait::async_trait;
use chrono::Utc;
use std::{
	collections::BTreeMap,
	sync::{Mutex, MutexGuard},
};

use weir_api::{
	artifact::{
		ArtifactEntryModel, ArtifactState, MetricModel, NodeRecord, ParamModel, RunModel,
		TriggerModel,
	},
	labels::NodeLabel,
	rpc::{CreateEntryRequest, EntriesQuery, HistoryQuery},
	status::BaseType,
};
use weir_pipeline::node::{MetadataError, MetadataStore};

#[derive(Default)]
struct Inner {
	nodes: Vec<NodeRecord>,
	runs: Vec<RunModel>,
	artifacts: Vec<(i64, ArtifactEntryModel)>, // (node_id, entry)
	metrics: Vec<MetricModel>,
	params: Vec<ParamModel>,
	tags: Vec<ParamModel>,
	triggers: Vec<TriggerModel>,
	next_node_id: i64,
	next_entry_id: i64,
	next_trigger_id: i64,
}

impl Inner {
	fn node_id(&self, name: &NodeLabel) -> Result<i64, MetadataError> {
		self.nodes
			.iter()
			.find(|n| n.node_name == *name)
			.map(|n| n.id)
			.ok_or_else(|| MetadataError::NoSuchNode(name.clone()))
	}

	fn active_run_id(&self) -> i64 {
		match self.runs.last() {
			None => 0,
			Some(run) => match run.end_time {
				None => run.run_id,
				Some(_) => run.run_id + 1,
			},
		}
	}
}

/// A [`MetadataStore`] kept entirely in memory, behind one mutex.
pub struct MemoryMetadataStore {
	inner: Mutex<Inner>,
}

impl MemoryMetadataStore {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
		}
	}

	fn lock(&self) -> Result<MutexGuard<'_, Inner>, MetadataError> {
		self.inner
			.lock()
			.map_err(|_| MetadataError::Rpc("metadata store mutex poisoned".into()))
	}
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
	async fn add_node(
		&self,
		node_name: &NodeLabel,
		node_type: &str,
		base_type: BaseType,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;

		if inner.nodes.iter().any(|n| n.node_name == *node_name) {
			return Ok(());
		}

		inner.next_node_id += 1;
		let id = inner.next_node_id;
		inner.nodes.push(NodeRecord {
			id,
			node_name: node_name.clone(),
			node_type: node_type.into(),
			base_type,
			init_time: Utc::now(),
		});

		return Ok(());
	}

	async fn node_exists(&self, node_name: &NodeLabel) -> Result<bool, MetadataError> {
		let inner = self.lock()?;
		return Ok(inner.nodes.iter().any(|n| n.node_name == *node_name));
	}

	async fn get_node_id(&self, node_name: &NodeLabel) -> Result<i64, MetadataError> {
		self.lock()?.node_id(node_name)
	}

	async fn get_nodes_info(&self) -> Result<Vec<NodeRecord>, MetadataError> {
		return Ok(self.lock()?.nodes.clone());
	}

	async fn get_run_id(&self) -> Result<i64, MetadataError> {
		return Ok(self.lock()?.active_run_id());
	}

	async fn start_run(&self, run_id: i64) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		let start_time = Utc::now();

		inner.runs.push(RunModel {
			run_id,
			start_time,
			end_time: None,
		});

		for (_, entry) in inner.artifacts.iter_mut() {
			if entry.state == ArtifactState::New && entry.run_id.is_none() {
				entry.state = ArtifactState::Current;
				entry.run_id = Some(run_id);
			}
		}

		for trigger in inner.triggers.iter_mut() {
			if trigger.run_triggered.is_none() && trigger.trigger_time <= start_time {
				trigger.run_triggered = Some(run_id);
			}
		}

		return Ok(());
	}

	async fn end_run(&self, run_id: i64) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		let end_time = Utc::now();

		if let Some(run) = inner.runs.iter_mut().find(|r| r.run_id == run_id) {
			if run.end_time.is_none() {
				run.end_time = Some(end_time);
			}
		}

		for (_, entry) in inner.artifacts.iter_mut() {
			if entry.state == ArtifactState::Current && entry.end_time.is_none() {
				entry.state = ArtifactState::Old;
				entry.end_time = Some(end_time);
			}
		}

		return Ok(());
	}

	async fn get_runs(&self) -> Result<Vec<RunModel>, MetadataError> {
		return Ok(self.lock()?.runs.clone());
	}

	async fn create_entry(&self, entry: CreateEntryRequest) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		let node_id = inner.node_id(&entry.resource_node_name)?;

		inner.next_entry_id += 1;
		let id = inner.next_entry_id;
		inner.artifacts.push((
			node_id,
			ArtifactEntryModel {
				id,
				run_id: entry.run_id,
				node_name: entry.resource_node_name,
				location: entry.location,
				created_at: Utc::now(),
				end_time: None,
				state: entry.state,
				hash: entry.hash,
				hash_algorithm: entry.hash_algorithm,
				size: entry.size,
				content_type: entry.content_type,
			},
		));

		return Ok(());
	}

	async fn entry_exists(
		&self,
		resource_node_name: &NodeLabel,
		location: &str,
	) -> Result<bool, MetadataError> {
		let inner = self.lock()?;
		let node_id = inner.node_id(resource_node_name)?;

		return Ok(inner
			.artifacts
			.iter()
			.any(|(n, e)| *n == node_id && e.location == location));
	}

	async fn update_entry(
		&self,
		resource_node_name: &NodeLabel,
		entry_id: i64,
		state: ArtifactState,
		run_id: Option<i64>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		let node_id = inner.node_id(resource_node_name)?;

		for (n, entry) in inner.artifacts.iter_mut() {
			if *n == node_id && entry.id == entry_id {
				entry.state = state;
				entry.run_id = run_id;
				return Ok(());
			}
		}

		return Err(MetadataError::NoSuchEntry(entry_id));
	}

	async fn get_num_entries(
		&self,
		resource_node_name: &NodeLabel,
		state: Option<ArtifactState>,
	) -> Result<i64, MetadataError> {
		let inner = self.lock()?;
		let node_id = inner.node_id(resource_node_name)?;

		let count = inner
			.artifacts
			.iter()
			.filter(|(n, e)| *n == node_id && state.map(|s| e.state == s).unwrap_or(true))
			.count();

		return Ok(count as i64);
	}

	async fn get_entries(
		&self,
		query: EntriesQuery,
	) -> Result<Vec<ArtifactEntryModel>, MetadataError> {
		let inner = self.lock()?;

		let node_id = match &query.resource_node_name {
			Some(name) => Some(inner.node_id(name)?),
			None => None,
		};

		return Ok(inner
			.artifacts
			.iter()
			.filter(|(n, e)| {
				node_id.map(|id| *n == id).unwrap_or(true)
					&& query.state.map(|s| e.state == s).unwrap_or(true)
					&& query.run_id.map(|r| e.run_id == Some(r)).unwrap_or(true)
			})
			.map(|(_, e)| e.clone())
			.collect());
	}

	async fn merge_artifacts_table(
		&self,
		resource_node_name: &NodeLabel,
		entries: Vec<ArtifactEntryModel>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		let node_id = inner.node_id(resource_node_name)?;

		for entry in entries {
			let existing = inner
				.artifacts
				.iter()
				.position(|(n, e)| *n == node_id && e.location == entry.location);

			match existing {
				Some(index) => {
					let (_, e) = &mut inner.artifacts[index];
					e.run_id = entry.run_id;
					e.state = entry.state;
					e.end_time = entry.end_time;
					e.hash = entry.hash;
					e.hash_algorithm = entry.hash_algorithm;
					e.size = entry.size;
					e.content_type = entry.content_type;
				}
				None => {
					inner.next_entry_id += 1;
					let id = inner.next_entry_id;
					inner.artifacts.push((
						node_id,
						ArtifactEntryModel {
							id,
							node_name: resource_node_name.clone(),
							..entry
						},
					));
				}
			}
		}

		return Ok(());
	}

	async fn log_metrics(
		&self,
		node_name: &NodeLabel,
		metrics: BTreeMap<String, f64>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		inner.node_id(node_name)?;
		let run_id = inner.active_run_id();

		for (name, value) in metrics {
			inner.metrics.push(MetricModel {
				run_id,
				node_name: node_name.clone(),
				name,
				value,
			});
		}

		return Ok(());
	}

	async fn log_params(
		&self,
		node_name: &NodeLabel,
		params: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		inner.node_id(node_name)?;
		let run_id = inner.active_run_id();

		for (name, value) in params {
			inner.params.push(ParamModel {
				run_id,
				node_name: node_name.clone(),
				name,
				value,
			});
		}

		return Ok(());
	}

	async fn set_tags(
		&self,
		node_name: &NodeLabel,
		tags: BTreeMap<String, String>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		inner.node_id(node_name)?;
		let run_id = inner.active_run_id();

		for (name, value) in tags {
			inner.tags.push(ParamModel {
				run_id,
				node_name: node_name.clone(),
				name,
				value,
			});
		}

		return Ok(());
	}

	async fn get_metrics(&self, query: HistoryQuery) -> Result<Vec<MetricModel>, MetadataError> {
		let inner = self.lock()?;
		return Ok(inner
			.metrics
			.iter()
			.filter(|m| {
				query
					.node_name
					.as_ref()
					.map(|n| m.node_name == *n)
					.unwrap_or(true) && query.run_id.map(|r| m.run_id == r).unwrap_or(true)
			})
			.cloned()
			.collect());
	}

	async fn get_params(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		let inner = self.lock()?;
		return Ok(inner
			.params
			.iter()
			.filter(|p| {
				query
					.node_name
					.as_ref()
					.map(|n| p.node_name == *n)
					.unwrap_or(true) && query.run_id.map(|r| p.run_id == r).unwrap_or(true)
			})
			.cloned()
			.collect());
	}

	async fn get_tags(&self, query: HistoryQuery) -> Result<Vec<ParamModel>, MetadataError> {
		let inner = self.lock()?;
		return Ok(inner
			.tags
			.iter()
			.filter(|t| {
				query
					.node_name
					.as_ref()
					.map(|n| t.node_name == *n)
					.unwrap_or(true) && query.run_id.map(|r| t.run_id == r).unwrap_or(true)
			})
			.cloned()
			.collect());
	}

	async fn log_trigger(
		&self,
		node_name: &NodeLabel,
		message: Option<&str>,
	) -> Result<(), MetadataError> {
		let mut inner = self.lock()?;
		inner.node_id(node_name)?;

		inner.next_trigger_id += 1;
		let id = inner.next_trigger_id;
		inner.triggers.push(TriggerModel {
			id,
			node_name: node_name.clone(),
			trigger_time: Utc::now(),
			message: message.map(|x| x.into()),
			run_triggered: None,
		});

		return Ok(());
	}
}

impl MemoryMetadataStore {
	/// All logged triggers. The SQLite store keeps these in its
	/// `triggers` table; here they are exposed for inspection.
	pub fn triggers(&self) -> Vec<TriggerModel> {
		self.inner
			.lock()
			.map(|x| x.triggers.clone())
			.unwrap_or_default()
	}
}
