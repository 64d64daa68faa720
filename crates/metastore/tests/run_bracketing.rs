//! Run bracketing semantics, checked against both backends:
//! every `current` entry of a run was `new` before the run started and
//! is `old` once the run ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use weir_api::{
	artifact::ArtifactState,
	labels::NodeLabel,
	rpc::{CreateEntryRequest, EntriesQuery, HistoryQuery},
	status::BaseType,
};
use weir_metastore::{MemoryMetadataStore, SqliteMetadataStore};
use weir_pipeline::node::MetadataStore;

fn entry(node: &NodeLabel, location: &str) -> CreateEntryRequest {
	CreateEntryRequest {
		resource_node_name: node.clone(),
		location: location.into(),
		state: ArtifactState::New,
		run_id: None,
		hash: Some("aa".repeat(32)),
		hash_algorithm: Some("sha256".into()),
		size: Some(3),
		content_type: None,
	}
}

async fn check_run_bracketing(store: Arc<dyn MetadataStore>) {
	store.init().await.unwrap();

	let resource = NodeLabel::new("data");
	store
		.add_node(&resource, "FilesystemStore", BaseType::Resource)
		.await
		.unwrap();

	// two artifacts appear before the run
	store.create_entry(entry(&resource, "a.txt")).await.unwrap();
	store.create_entry(entry(&resource, "b.txt")).await.unwrap();
	assert!(store.entry_exists(&resource, "a.txt").await.unwrap());
	assert!(!store.entry_exists(&resource, "c.txt").await.unwrap());

	assert_eq!(
		store
			.get_num_entries(&resource, Some(ArtifactState::New))
			.await
			.unwrap(),
		2
	);
	assert_eq!(store.get_run_id().await.unwrap(), 0);

	// a trigger fires, then the run opens
	store
		.log_trigger(&resource, Some("new artifacts"))
		.await
		.unwrap();
	store.start_run(0).await.unwrap();
	assert_eq!(store.get_run_id().await.unwrap(), 0);

	// new -> current, stamped with this run
	let current = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(resource.clone()),
			state: Some(ArtifactState::Current),
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(current.len(), 2);
	assert!(current.iter().all(|e| e.run_id == Some(0)));
	assert!(current.iter().all(|e| e.end_time.is_none()));

	// an artifact appearing mid-run stays out of the current window
	store.create_entry(entry(&resource, "late.txt")).await.unwrap();

	store.end_run(0).await.unwrap();
	assert_eq!(store.get_run_id().await.unwrap(), 1);

	// current -> old, stamped with an end time
	let old = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(resource.clone()),
			state: Some(ArtifactState::Old),
			run_id: Some(0),
		})
		.await
		.unwrap();
	assert_eq!(old.len(), 2);
	assert!(old.iter().all(|e| e.end_time.is_some()));

	// the late artifact is picked up by the next run
	store.start_run(1).await.unwrap();
	let current = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(resource.clone()),
			state: Some(ArtifactState::Current),
			run_id: Some(1),
		})
		.await
		.unwrap();
	assert_eq!(current.len(), 1);
	assert_eq!(current[0].location, "late.txt");

	// one run closed, one open, with start < end where closed
	let runs = store.get_runs().await.unwrap();
	assert_eq!(runs.len(), 2);
	assert!(runs[0].end_time.unwrap() > runs[0].start_time);
	assert!(runs[1].end_time.is_none());
}

#[tokio::test]
async fn sqlite_run_bracketing() {
	let store = Arc::new(SqliteMetadataStore::open_in_memory().await.unwrap());
	check_run_bracketing(store).await;
}

#[tokio::test]
async fn memory_run_bracketing() {
	let store = Arc::new(MemoryMetadataStore::new());
	check_run_bracketing(store).await;
}

#[tokio::test]
async fn sqlite_persists_to_disk() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("meta.db");
	let uri = format!("sqlite://{}", path.display());

	{
		let store = SqliteMetadataStore::connect(&uri).await.unwrap();
		store.init().await.unwrap();
		store
			.add_node(&NodeLabel::new("data"), "FilesystemStore", BaseType::Resource)
			.await
			.unwrap();
	}

	let store = SqliteMetadataStore::connect(&uri).await.unwrap();
	assert!(store.node_exists(&NodeLabel::new("data")).await.unwrap());
}

#[tokio::test]
async fn metrics_params_and_tags_are_scoped_to_runs() {
	let store = SqliteMetadataStore::open_in_memory().await.unwrap();
	store.init().await.unwrap();

	let node = NodeLabel::new("train");
	store
		.add_node(&node, "TrainAction", BaseType::Action)
		.await
		.unwrap();

	store.start_run(0).await.unwrap();
	store
		.log_metrics(&node, BTreeMap::from([("loss".into(), 0.5)]))
		.await
		.unwrap();
	store
		.log_params(&node, BTreeMap::from([("lr".into(), "1e-3".into())]))
		.await
		.unwrap();
	store.end_run(0).await.unwrap();

	store.start_run(1).await.unwrap();
	store
		.log_metrics(&node, BTreeMap::from([("loss".into(), 0.25)]))
		.await
		.unwrap();
	store
		.set_tags(&node, BTreeMap::from([("stage".into(), "eval".into())]))
		.await
		.unwrap();

	let all = store
		.get_metrics(HistoryQuery {
			node_name: Some(node.clone()),
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(all.len(), 2);

	let second = store
		.get_metrics(HistoryQuery {
			node_name: None,
			run_id: Some(1),
		})
		.await
		.unwrap();
	assert_eq!(second.len(), 1);
	assert_eq!(second[0].value, 0.25);

	let params = store
		.get_params(HistoryQuery {
			node_name: Some(node.clone()),
			run_id: Some(0),
		})
		.await
		.unwrap();
	assert_eq!(params.len(), 1);
	assert_eq!(params[0].value, "1e-3");

	let tags = store
		.get_tags(HistoryQuery {
			node_name: Some(node.clone()),
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(tags.len(), 1);
	assert_eq!(tags[0].name, "stage");
}

#[tokio::test]
async fn triggers_are_associated_with_the_run_they_open() {
	let store = MemoryMetadataStore::new();

	let node = NodeLabel::new("meta");
	store
		.add_node(&node, "MemoryMetadataStore", BaseType::MetadataStore)
		.await
		.unwrap();

	store.log_trigger(&node, Some("first")).await.unwrap();
	store.log_trigger(&node, None).await.unwrap();

	store.start_run(0).await.unwrap();

	let triggers = store.triggers();
	assert_eq!(triggers.len(), 2);
	assert!(triggers.iter().all(|t| t.run_triggered == Some(0)));

	// triggers logged after start_run wait for the next run
	store.log_trigger(&node, Some("late")).await.unwrap();
	let triggers = store.triggers();
	assert_eq!(triggers[2].run_triggered, None);
}

#[tokio::test]
async fn merge_upserts_by_location() {
	let store = SqliteMetadataStore::open_in_memory().await.unwrap();
	store.init().await.unwrap();

	let node = NodeLabel::new("data");
	store
		.add_node(&node, "FilesystemStore", BaseType::Resource)
		.await
		.unwrap();
	store.create_entry(entry(&node, "a.txt")).await.unwrap();

	let mut imported = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(node.clone()),
			state: None,
			run_id: None,
		})
		.await
		.unwrap();
	imported[0].state = ArtifactState::Old;
	imported.push(weir_api::artifact::ArtifactEntryModel {
		id: 99,
		run_id: None,
		node_name: node.clone(),
		location: "imported.txt".into(),
		created_at: chrono::Utc::now(),
		end_time: None,
		state: ArtifactState::New,
		hash: None,
		hash_algorithm: None,
		size: None,
		content_type: None,
	});

	store.merge_artifacts_table(&node, imported).await.unwrap();

	assert_eq!(store.get_num_entries(&node, None).await.unwrap(), 2);
	assert_eq!(
		store
			.get_num_entries(&node, Some(ArtifactState::Old))
			.await
			.unwrap(),
		1
	);
	assert!(store.entry_exists(&node, "imported.txt").await.unwrap());
}
