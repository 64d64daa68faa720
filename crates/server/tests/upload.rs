//! Streamed artifact transfer: uploads are hash-verified before anything
//! is recorded, downloads are verified on arrival.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use weir_api::{artifact::ArtifactState, labels::NodeLabel, rpc::EntriesQuery};
use weir_metastore::MemoryMetadataStore;
use weir_nodes::FilesystemStore;
use weir_pipeline::{
	node::{MetadataStore, MetadataStoreNode, Node, NodeOptions, ResourceNode},
	pipeline::Pipeline,
};
use weir_server::{FilesystemStoreClient, PipelineServer};

const PAYLOAD_SIZE: usize = 3 * 1024 * 1024;

fn payload() -> Vec<u8> {
	(0..PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect()
}

fn hex_sha256(data: &[u8]) -> String {
	format!("{:x}", Sha256::digest(data))
}

struct Registry {
	server: weir_server::ServerHandle,
	store: Arc<MemoryMetadataStore>,
	dir: tempfile::TempDir,
}

/// A server hosting a registry-style resource node: no monitoring, written
/// to only through its RPC surface.
async fn start_registry() -> Registry {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(MemoryMetadataStore::new());

	let meta = Arc::new(MetadataStoreNode::new(
		"meta",
		"MemoryMetadataStore",
		store.clone(),
		NodeOptions::default(),
	));
	let registry = Arc::new(
		ResourceNode::new(
			"registry",
			"FilesystemStore",
			Arc::new(FilesystemStore::new(dir.path()).writable()),
			store.clone(),
			NodeOptions {
				predecessors: vec![NodeLabel::new("meta")],
				..Default::default()
			},
		)
		.without_monitoring(),
	);

	let nodes: Vec<Arc<dyn Node>> = vec![meta, registry];
	let pipeline = Pipeline::new("registry", nodes).unwrap();
	let server = PipelineServer::new("registry", "127.0.0.1", 0, pipeline, Vec::new())
		.unwrap()
		.start()
		.await
		.unwrap();

	Registry { server, store, dir }
}

#[tokio::test]
async fn upload_with_wrong_hash_is_rejected_and_unrecorded() {
	let registry = start_registry().await;
	let url = format!(
		"{}/registry/api/server/upload_stream",
		registry.server.origin()
	);

	let response = reqwest::Client::new()
		.post(&url)
		.header("x-filename", "models/bogus.bin")
		.header("x-file-hash", "0".repeat(64))
		.body(payload())
		.send()
		.await
		.unwrap();

	assert!(response.status().is_server_error());

	// nothing recorded, nothing left on disk
	let entries = registry
		.store
		.get_entries(EntriesQuery {
			resource_node_name: Some(NodeLabel::new("registry")),
			state: None,
			run_id: None,
		})
		.await
		.unwrap();
	assert!(entries.is_empty());
	assert!(!registry.dir.path().join("models/bogus.bin").exists());

	registry.server.shutdown().await;
}

#[tokio::test]
async fn verified_upload_is_stored_and_recorded_as_current() {
	let registry = start_registry().await;

	let staging = tempfile::tempdir().unwrap();
	let client = FilesystemStoreClient::with_server_url(
		"trainer",
		staging.path(),
		&format!("{}/registry/api/server", registry.server.origin()),
	);

	let data = payload();
	std::fs::create_dir_all(client.storage_directory()).unwrap();
	std::fs::write(client.storage_directory().join("model.bin"), &data).unwrap();

	let response = client
		.upload_file("model.bin", "models/model.bin")
		.await
		.unwrap();
	assert_eq!(response.filename, "models/model.bin");
	assert_eq!(response.bytes_received, data.len() as u64);

	// stored with matching bytes
	let stored = std::fs::read(registry.dir.path().join("models/model.bin")).unwrap();
	assert_eq!(stored, data);

	// recorded as current, hash and size intact
	let entries = registry
		.store
		.get_entries(EntriesQuery {
			resource_node_name: Some(NodeLabel::new("registry")),
			state: Some(ArtifactState::Current),
			run_id: None,
		})
		.await
		.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].location, "models/model.bin");
	assert_eq!(entries[0].hash.as_deref(), Some(hex_sha256(&data).as_str()));
	assert_eq!(entries[0].size, Some(data.len() as i64));

	// uploading to the same location again is a conflict
	match client.upload_file("model.bin", "models/model.bin").await {
		Err(weir_server::rpc::RpcError::Rejected { status: 409, .. }) => {}
		other => panic!("expected 409 conflict, got {other:?}"),
	}

	registry.server.shutdown().await;
}

#[tokio::test]
async fn download_streams_with_hash_header() {
	let registry = start_registry().await;
	let data = payload();

	std::fs::create_dir_all(registry.dir.path().join("models")).unwrap();
	std::fs::write(registry.dir.path().join("models/model.bin"), &data).unwrap();

	// raw response carries the hash header
	let url = format!(
		"{}/registry/api/server/get_artifact/models/model.bin",
		registry.server.origin()
	);
	let response = reqwest::get(&url).await.unwrap();
	assert_eq!(response.status(), 200);
	assert_eq!(
		response
			.headers()
			.get("x-file-hash")
			.and_then(|x| x.to_str().ok()),
		Some(hex_sha256(&data).as_str())
	);
	assert_eq!(response.bytes().await.unwrap().len(), data.len());

	// the client verifies the hash while staging the download
	let staging = tempfile::tempdir().unwrap();
	let client = FilesystemStoreClient::with_server_url(
		"consumer",
		staging.path(),
		&format!("{}/registry/api/server", registry.server.origin()),
	);

	let local = client.get_artifact("models/model.bin").await.unwrap();
	assert_eq!(std::fs::read(local).unwrap(), data);

	// a missing artifact is a clean rejection
	match client.get_artifact("models/missing.bin").await {
		Err(weir_server::rpc::RpcError::Rejected { status: 404, .. }) => {}
		other => panic!("expected 404, got {other:?}"),
	}

	registry.server.shutdown().await;
}
