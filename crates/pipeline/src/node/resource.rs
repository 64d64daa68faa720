//! The resource node: watches an external store of artifacts, triggers
//! runs when new material appears, and brackets the "current" artifact
//! window while a run is active.

use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

use weir_api::{
	artifact::ArtifactState,
	labels::NodeLabel,
	rpc::CreateEntryRequest,
	status::{BaseType, NodeResult, NodeStatus},
};
use weir_util::hash::HASH_ALGORITHM;

use super::{MetadataError, MetadataStore, Node, NodeCore, NodeOptions, MONITOR_PERIOD};
use crate::{errors::HookError, latch::Latch};

/// A candidate artifact found by [`ArtifactStore::discover`].
#[derive(Debug, Clone)]
pub struct DiscoveredArtifact {
	/// Location relative to the store's root
	pub location: String,
	/// Lowercase-hex content hash
	pub hash: String,
	pub size: Option<i64>,
	pub content_type: Option<String>,
}

/// A watched store of artifacts (a directory, a bucket, ...).
///
/// The store only knows how to find and address artifacts; which of them
/// are new, current or old is the metadata store's business.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
	/// One-time setup (create the root directory, check credentials, ...)
	async fn init(&self) -> Result<(), HookError> {
		Ok(())
	}

	/// Scan for candidate artifacts, hashing each one.
	async fn discover(&self) -> Result<Vec<DiscoveredArtifact>, HookError>;

	/// The absolute path of an artifact, given its relative location.
	fn resolve(&self, location: &str) -> PathBuf;

	/// Hash the artifact at the given relative location.
	async fn hash_of(&self, location: &str) -> Result<String, HookError> {
		let path = self.resolve(location);
		let hash = weir_util::hash::hash_file(&path).await?;
		return Ok(hash);
	}
}

/// A user-supplied trigger condition for a resource monitor.
/// Returning `Some(message)` fires the trigger with that message.
#[async_trait]
pub trait ResourceTrigger: Send + Sync + 'static {
	async fn check(
		&self,
		metadata: &dyn MetadataStore,
		node_name: &NodeLabel,
	) -> Result<Option<String>, MetadataError>;
}

/// A node watching one artifact store.
///
/// With monitoring enabled, a helper task discovers artifacts, records
/// them as `new`, and fires the trigger; the main loop then handshakes a
/// run through the metadata store. With monitoring disabled (e.g. a
/// write-only model registry) the node participates in the handshake only.
pub struct ResourceNode {
	core: Arc<NodeCore>,
	store: Arc<dyn ArtifactStore>,
	metadata: Arc<dyn MetadataStore>,
	trigger: Latch,
	monitoring: bool,
	custom_trigger: Option<Arc<dyn ResourceTrigger>>,
}

impl ResourceNode {
	/// Make a new resource node.
	///
	/// `metadata` is this node's handle to its pipeline's metadata store:
	/// either the store itself, or an RPC client for a store in an
	/// upstream pipeline. When the store is local, remember to list its
	/// node in `options.predecessors`.
	pub fn new(
		name: &str,
		node_type: &str,
		store: Arc<dyn ArtifactStore>,
		metadata: Arc<dyn MetadataStore>,
		options: NodeOptions,
	) -> Self {
		Self {
			core: Arc::new(NodeCore::new(name, node_type, BaseType::Resource, options)),
			store,
			metadata,
			trigger: Latch::new(),
			monitoring: true,
			custom_trigger: None,
		}
	}

	/// Disable the monitor: the node joins the handshake but never
	/// triggers runs itself.
	pub fn without_monitoring(mut self) -> Self {
		self.monitoring = false;
		self
	}

	/// Replace the default count(new) > 0 trigger condition.
	pub fn with_trigger(mut self, trigger: Arc<dyn ResourceTrigger>) -> Self {
		self.custom_trigger = Some(trigger);
		self
	}

	pub fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
		self.store.clone()
	}

	pub fn metadata(&self) -> Arc<dyn MetadataStore> {
		self.metadata.clone()
	}

	pub fn monitoring(&self) -> bool {
		self.monitoring
	}

	//
	// MARK: Metadata helpers
	//

	pub async fn entry_exists(&self, location: &str) -> Result<bool, MetadataError> {
		self.metadata.entry_exists(self.core.name(), location).await
	}

	/// Record a discovered artifact as `new`.
	pub async fn record_new(&self, artifact: &DiscoveredArtifact) -> Result<(), MetadataError> {
		self.metadata
			.create_entry(CreateEntryRequest {
				resource_node_name: self.core.name().clone(),
				location: artifact.location.clone(),
				state: ArtifactState::New,
				run_id: None,
				hash: Some(artifact.hash.clone()),
				hash_algorithm: Some(HASH_ALGORITHM.into()),
				size: artifact.size,
				content_type: artifact.content_type.clone(),
			})
			.await
	}

	/// Record an artifact produced during the active run as `current`.
	pub async fn record_current(
		&self,
		location: &str,
		hash: &str,
		size: Option<i64>,
		content_type: Option<String>,
	) -> Result<(), MetadataError> {
		let run_id = self.metadata.get_run_id().await?;

		self.metadata
			.create_entry(CreateEntryRequest {
				resource_node_name: self.core.name().clone(),
				location: location.into(),
				state: ArtifactState::Current,
				run_id: Some(run_id),
				hash: Some(hash.into()),
				hash_algorithm: Some(HASH_ALGORITHM.into()),
				size,
				content_type,
			})
			.await
	}

	pub async fn get_num_artifacts(
		&self,
		state: Option<ArtifactState>,
	) -> Result<i64, MetadataError> {
		self.metadata.get_num_entries(self.core.name(), state).await
	}

	/// Resolve an artifact for reading, checking its content against the
	/// hash the metadata store has on record. A mismatch is logged but
	/// not fatal: the file may legitimately be mid-supersession.
	pub async fn load_artifact(&self, location: &str) -> Result<PathBuf, MetadataError> {
		let path = self.store.resolve(location);
		if !path.exists() {
			return Err(MetadataError::Backend(Box::new(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("no artifact at {}", path.display()),
			))));
		}

		let entries = self
			.metadata
			.get_entries(weir_api::rpc::EntriesQuery {
				resource_node_name: Some(self.core.name().clone()),
				state: None,
				run_id: None,
			})
			.await?;

		let expected = entries
			.iter()
			.find(|e| e.location == location)
			.and_then(|e| e.hash.clone());

		if let Some(expected) = expected {
			match self.store.hash_of(location).await {
				Ok(actual) if actual != expected => {
					warn!(
						message = "Artifact hash mismatch",
						node = %self.core.name(),
						location,
						expected,
						actual,
					);
				}
				Ok(_) => {}
				Err(error) => {
					warn!(
						message = "Could not hash artifact for verification",
						node = %self.core.name(),
						location,
						%error,
					);
				}
			}
		}

		return Ok(path);
	}

	pub async fn list_artifacts(&self, state: ArtifactState) -> Result<Vec<String>, MetadataError> {
		let entries = self
			.metadata
			.get_entries(weir_api::rpc::EntriesQuery {
				resource_node_name: Some(self.core.name().clone()),
				state: Some(state),
				run_id: None,
			})
			.await?;

		return Ok(entries.into_iter().map(|e| e.location).collect());
	}

	/// Fire the resource trigger. As with the metadata trigger, the
	/// message is logged before the latch is set.
	pub async fn trigger(&self, message: Option<&str>) {
		if self.trigger.is_set() {
			return;
		}

		if message.is_some() {
			match self.metadata.log_trigger(self.core.name(), message).await {
				Ok(()) => {}
				Err(MetadataError::NotConnected) => {}
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

	//
	// MARK: Monitoring
	//

	/// The monitor helper: discover artifacts, record the unseen ones as
	/// `new`, then check the trigger condition. Metadata calls made before
	/// an upstream connection is established are suppressed and retried on
	/// the next tick.
	async fn monitor(self: Arc<Self>) {
		debug!(message = "Starting observer task", node = %self.core.name());

		while !self.core.exiting() {
			match self.store.discover().await {
				Ok(artifacts) => {
					for artifact in artifacts {
						if self.core.exiting() {
							break;
						}

						match self.entry_exists(&artifact.location).await {
							Ok(true) => {}
							Ok(false) => match self.record_new(&artifact).await {
								Ok(()) => {
									info!(
										message = "Detected artifact",
										node = %self.core.name(),
										location = artifact.location,
									);
								}
								Err(MetadataError::NotConnected) => {}
								Err(error) => {
									warn!(
										message = "Could not record artifact",
										node = %self.core.name(),
										location = artifact.location,
										%error,
									);
								}
							},
							Err(MetadataError::NotConnected) => {}
							Err(error) => {
								warn!(
									message = "Could not check artifact entry",
									node = %self.core.name(),
									location = artifact.location,
									%error,
								);
							}
						}
					}
				}
				Err(error) => {
					warn!(
						message = "Error while scanning resource",
						node = %self.core.name(),
						%error,
					);
				}
			}

			if self.core.exiting() {
				break;
			}

			match self.check_trigger().await {
				Ok(Some(message)) => self.trigger(Some(&message)).await,
				Ok(None) => {}
				Err(MetadataError::NotConnected) => {}
				Err(error) => {
					warn!(
						message = "Error checking resource trigger",
						node = %self.core.name(),
						%error,
					);
				}
			}

			if self.core.sleep_or_exit(MONITOR_PERIOD).await {
				break;
			}
		}

		debug!(message = "Observer task exited", node = %self.core.name());
	}

	async fn check_trigger(&self) -> Result<Option<String>, MetadataError> {
		if let Some(t) = &self.custom_trigger {
			return t.check(&*self.metadata, self.core.name()).await;
		}

		let new = self.get_num_artifacts(Some(ArtifactState::New)).await?;
		if new > 0 {
			return Ok(Some(format!("{new} new artifacts detected")));
		}

		return Ok(None);
	}
}

#[async_trait]
impl Node for ResourceNode {
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

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
		self
	}

	async fn run_loop(self: Arc<Self>) {
		let core = self.core.clone();

		let monitor = if self.monitoring {
			Some(tokio::spawn(self.clone().monitor()))
		} else {
			None
		};

		core.await_connection().await;

		while !core.exiting() {
			core.wait_if_paused().await;

			if self.monitoring {
				// wait until the monitor has found something worth a run
				core.set_status(NodeStatus::WaitingResource);
				self.trigger.wait().await;
				if core.exiting() {
					break;
				}
				self.trigger.clear();
				core.set_status(NodeStatus::Triggered);
			}

			// tell the metadata store we are ready for the next run
			core.signal_predecessors(NodeResult::Success).await;
			if core.exiting() {
				break;
			}

			// wait until the run is open
			core.set_status(NodeStatus::WaitingPredecessors);
			core.wait_for_predecessors().await;
			if core.exiting() {
				break;
			}

			// the current window is pinned; let the actions at it
			core.signal_successors(NodeResult::Success).await;
			if core.exiting() {
				break;
			}

			// wait until every action is done with the current window
			core.set_status(NodeStatus::WaitingSuccessors);
			core.wait_for_successors().await;
			if core.exiting() {
				break;
			}

			// let the metadata store close the run
			core.signal_predecessors(NodeResult::Success).await;
			if core.exiting() {
				break;
			}

			// wait for the run-closed acknowledgement
			core.set_status(NodeStatus::WaitingPredecessors);
			core.wait_for_predecessors().await;
		}

		if let Some(monitor) = monitor {
			match monitor.await {
				Ok(()) => {}
				Err(error) => {
					warn!(message = "Observer task panicked", node = %core.name(), %error);
				}
			}
		}
	}
}
