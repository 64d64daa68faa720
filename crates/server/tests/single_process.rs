//! One server, one pipeline, one run: the single-process end-to-end
//! path, backed by a real SQLite metadata store, plus SSE replay.

mod common;

use futures::StreamExt;
use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use common::{eventually, CountAction};
use weir_api::{artifact::ArtifactState, labels::NodeLabel, rpc::EntriesQuery};
use weir_metastore::SqliteMetadataStore;
use weir_nodes::FilesystemStore;
use weir_pipeline::{
	node::{ActionNode, MetadataStoreNode, MetadataStore, Node, NodeOptions, ResourceNode},
	pipeline::Pipeline,
};
use weir_server::PipelineServer;

#[tokio::test]
async fn one_file_one_run_end_to_end() {
	let dir = tempfile::tempdir().unwrap();
	let db_dir = tempfile::tempdir().unwrap();
	let uri = format!("sqlite://{}", db_dir.path().join("meta.db").display());

	let store: Arc<dyn MetadataStore> =
		Arc::new(SqliteMetadataStore::connect(&uri).await.unwrap());

	let meta = Arc::new(MetadataStoreNode::new(
		"meta",
		"SqliteMetadataStore",
		store.clone(),
		NodeOptions::default(),
	));
	let data = Arc::new(ResourceNode::new(
		"data",
		"FilesystemStore",
		Arc::new(FilesystemStore::new(dir.path())),
		store.clone(),
		NodeOptions {
			predecessors: vec![NodeLabel::new("meta")],
			..Default::default()
		},
	));
	let (count_action, executions) = CountAction::new();
	let count = Arc::new(ActionNode::new(
		"count",
		"CountAction",
		count_action,
		NodeOptions {
			predecessors: vec![NodeLabel::new("data")],
			..Default::default()
		},
	));

	let nodes: Vec<Arc<dyn Node>> = vec![meta, data, count];
	let pipeline = Pipeline::new("single", nodes).unwrap();
	let server = PipelineServer::new("single", "127.0.0.1", 0, pipeline, Vec::new())
		.unwrap()
		.start()
		.await
		.unwrap();

	// every local node was registered during setup
	for name in ["meta", "data", "count"] {
		assert!(store.node_exists(&NodeLabel::new(name)).await.unwrap());
	}

	std::fs::write(dir.path().join("f1.txt"), b"first").unwrap();

	{
		let executions = executions.clone();
		eventually("the action to run once", move || {
			executions.load(Ordering::SeqCst) == 1
		})
		.await;
	}

	// wait for run 0 to close
	let deadline = Instant::now() + common::PATIENCE;
	loop {
		let runs = store.get_runs().await.unwrap();
		if runs.len() == 1 && runs[0].end_time.is_some() {
			assert!(runs[0].end_time.unwrap() > runs[0].start_time);
			break;
		}
		if Instant::now() > deadline {
			panic!("run 0 never closed");
		}
		tokio::time::sleep(common::TICK).await;
	}

	// the artifact moved new -> current -> old within run 0
	let entries = store
		.get_entries(EntriesQuery {
			resource_node_name: Some(NodeLabel::new("data")),
			state: None,
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].state, ArtifactState::Old);
	assert_eq!(entries[0].run_id, Some(0));

	assert_eq!(executions.load(Ordering::SeqCst), 1);

	// the metadata RPC surface answers over HTTP too
	let run_id: serde_json::Value = reqwest::get(format!(
		"{}/meta/api/server/get_run_id",
		server.origin()
	))
	.await
	.unwrap()
	.json()
	.await
	.unwrap();
	assert_eq!(run_id["run_id"], 1);

	server.shutdown().await;
}

/// A client opening `/graph_sse` after activity has occurred first gets
/// the latest non-INITIALIZING status of every node, then the live tail.
#[tokio::test]
async fn sse_replays_latest_statuses_before_the_live_tail() {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(weir_metastore::MemoryMetadataStore::new());

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
		NodeOptions {
			predecessors: vec![NodeLabel::new("meta")],
			..Default::default()
		},
	));
	let (count_action, executions) = CountAction::new();
	let count = Arc::new(ActionNode::new(
		"count",
		"CountAction",
		count_action,
		NodeOptions {
			predecessors: vec![NodeLabel::new("data")],
			..Default::default()
		},
	));

	let nodes: Vec<Arc<dyn Node>> = vec![meta, data, count];
	let pipeline = Pipeline::new("sse", nodes).unwrap();
	let server = PipelineServer::new("sse", "127.0.0.1", 0, pipeline, Vec::new())
		.unwrap()
		.start()
		.await
		.unwrap();

	// drive one full run before any SSE client connects
	std::fs::write(dir.path().join("f1.txt"), b"first").unwrap();
	{
		let executions = executions.clone();
		eventually("the action to run once", move || {
			executions.load(Ordering::SeqCst) == 1
		})
		.await;
	}

	// connect late; the replay must still describe every node
	let response = reqwest::get(format!("{}/graph_sse", server.origin()))
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	assert_eq!(
		response
			.headers()
			.get("content-type")
			.and_then(|x| x.to_str().ok()),
		Some("text/event-stream")
	);

	let mut stream = response.bytes_stream();
	let mut seen = String::new();
	let deadline = Instant::now() + Duration::from_secs(10);

	while Instant::now() < deadline {
		let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
		match chunk {
			Ok(Some(Ok(bytes))) => {
				seen.push_str(&String::from_utf8_lossy(&bytes));
				let all_present = ["\"meta\"", "\"data\"", "\"count\""]
					.iter()
					.all(|id| seen.contains(id));
				if all_present {
					break;
				}
			}
			_ => break,
		}
	}

	for id in ["\"meta\"", "\"data\"", "\"count\""] {
		assert!(seen.contains(id), "SSE replay is missing {id}: {seen}");
	}
	assert!(seen.contains("event: WorkUpdate"));
	assert!(!seen.contains("INITIALIZING"));

	// close the stream before shutdown; graceful shutdown waits for
	// in-flight responses
	drop(stream);

	server.shutdown().await;
}
