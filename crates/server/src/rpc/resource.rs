//! Resource RPC: streamed artifact download and upload, hash-verified in
//! both directions.

use axum::{
	body::Body,
	extract::{Path as UrlPath, Query, Request, State},
	http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use futures::StreamExt;
use std::{
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use weir_api::{
	node::{MessageResponse, RpcConnectionModel},
	rpc::{ArtifactStateQuery, CountResponse, UploadResponse},
};
use weir_pipeline::node::{Node, ResourceNode};
use weir_util::hash::{hash_file, StreamHasher};

use super::{RpcClient, RpcError};

/// Header carrying the destination path of an upload.
pub const FILENAME_HEADER: &str = "x-filename";

/// Header carrying a file's lowercase-hex sha256.
pub const FILE_HASH_HEADER: &str = "x-file-hash";

/// Chunk size for streamed uploads.
const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

//
// MARK: Server
//

/// The RPC router for a resource node.
pub(crate) fn router(node: Arc<ResourceNode>) -> Router {
	Router::new()
		.route("/get_num_artifacts", get(get_num_artifacts))
		.route("/list_artifacts", get(list_artifacts))
		.route("/get_artifact/*path", get(get_artifact))
		.route("/upload_stream", post(upload_stream))
		.with_state(node)
}

async fn get_num_artifacts(
	State(node): State<Arc<ResourceNode>>,
	Query(query): Query<ArtifactStateQuery>,
) -> Response {
	match node.get_num_artifacts(Some(query.state)).await {
		Ok(count) => Json(CountResponse { count }).into_response(),
		Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
	}
}

async fn list_artifacts(
	State(node): State<Arc<ResourceNode>>,
	Query(query): Query<ArtifactStateQuery>,
) -> Response {
	match node.list_artifacts(query.state).await {
		Ok(locations) => Json(locations).into_response(),
		Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
	}
}

/// Stream an artifact, with its hash in [`FILE_HASH_HEADER`] so the
/// receiver can verify what arrived.
async fn get_artifact(
	State(node): State<Arc<ResourceNode>>,
	UrlPath(path): UrlPath<String>,
) -> Response {
	let store = node.artifact_store();
	let full_path = store.resolve(&path);

	if !full_path.is_file() {
		return (StatusCode::NOT_FOUND, format!("no artifact at `{path}`")).into_response();
	}

	let hash = match store.hash_of(&path).await {
		Ok(x) => x,
		Err(error) => {
			error!(message = "Could not hash artifact", path, %error);
			return (StatusCode::INTERNAL_SERVER_ERROR, "could not hash artifact").into_response();
		}
	};

	let file = match tokio::fs::File::open(&full_path).await {
		Ok(x) => x,
		Err(error) => {
			error!(message = "Could not open artifact", path, %error);
			return (StatusCode::INTERNAL_SERVER_ERROR, "could not open artifact").into_response();
		}
	};

	info!(message = "Sending artifact", node = %node.core().name(), path);

	let body = Body::from_stream(ReaderStream::new(file));
	return (
		[
			(CONTENT_TYPE.as_str(), "application/octet-stream"),
			(FILE_HASH_HEADER, hash.as_str()),
		],
		body,
	)
		.into_response();
}

/// Receive a streamed upload, hashing as it lands. A hash mismatch
/// removes the file and records nothing.
async fn upload_stream(
	State(node): State<Arc<ResourceNode>>,
	headers: HeaderMap,
	request: Request,
) -> Response {
	let filename = match headers.get(FILENAME_HEADER).and_then(|x| x.to_str().ok()) {
		Some(x) => x.trim_start_matches('/').to_owned(),
		None => {
			return (StatusCode::BAD_REQUEST, "missing x-filename header").into_response();
		}
	};

	let expected_hash = match headers.get(FILE_HASH_HEADER).and_then(|x| x.to_str().ok()) {
		Some(x) => x.to_owned(),
		None => {
			return (StatusCode::BAD_REQUEST, "missing x-file-hash header").into_response();
		}
	};

	let store = node.artifact_store();
	let destination = store.resolve(&filename);

	if destination.exists() {
		return (
			StatusCode::CONFLICT,
			format!("artifact `{filename}` already exists"),
		)
			.into_response();
	}

	if let Some(parent) = destination.parent() {
		match tokio::fs::create_dir_all(parent).await {
			Ok(()) => {}
			Err(error) => {
				error!(message = "Could not create upload directory", %error);
				return (StatusCode::INTERNAL_SERVER_ERROR, "could not create directory")
					.into_response();
			}
		}
	}

	let mut file = match tokio::fs::File::create(&destination).await {
		Ok(x) => x,
		Err(error) => {
			error!(message = "Could not create upload file", %error);
			return (StatusCode::INTERNAL_SERVER_ERROR, "could not create file").into_response();
		}
	};

	let mut hasher = StreamHasher::new();
	let mut bytes_received: u64 = 0;
	let mut stream = request.into_body().into_data_stream();

	while let Some(chunk) = stream.next().await {
		let chunk = match chunk {
			Ok(x) => x,
			Err(error) => {
				warn!(message = "Upload stream interrupted", filename, %error);
				let _ = tokio::fs::remove_file(&destination).await;
				return (StatusCode::INTERNAL_SERVER_ERROR, "upload interrupted").into_response();
			}
		};

		hasher.update(&chunk);
		bytes_received += chunk.len() as u64;

		match file.write_all(&chunk).await {
			Ok(()) => {}
			Err(error) => {
				error!(message = "Could not write upload chunk", filename, %error);
				let _ = tokio::fs::remove_file(&destination).await;
				return (StatusCode::INTERNAL_SERVER_ERROR, "could not write file").into_response();
			}
		}
	}

	if let Err(error) = file.flush().await {
		error!(message = "Could not flush upload", filename, %error);
		let _ = tokio::fs::remove_file(&destination).await;
		return (StatusCode::INTERNAL_SERVER_ERROR, "could not flush file").into_response();
	}
	drop(file);

	let actual_hash = hasher.finish();
	if actual_hash != expected_hash {
		error!(
			message = "Upload hash mismatch",
			filename,
			expected = expected_hash,
			actual = actual_hash,
		);
		let _ = tokio::fs::remove_file(&destination).await;
		return (StatusCode::INTERNAL_SERVER_ERROR, "uploaded file hash mismatch").into_response();
	}

	let content_type = headers
		.get(CONTENT_TYPE)
		.and_then(|x| x.to_str().ok())
		.map(|x| x.to_owned());

	// the upload lands inside the active run's window
	match node
		.record_current(&filename, &actual_hash, Some(bytes_received as i64), content_type)
		.await
	{
		Ok(()) => {}
		Err(error) => {
			error!(message = "Could not record uploaded artifact", filename, %error);
			let _ = tokio::fs::remove_file(&destination).await;
			return (StatusCode::INTERNAL_SERVER_ERROR, "could not record artifact")
				.into_response();
		}
	}

	info!(
		message = "Received artifact",
		node = %node.core().name(),
		filename,
		bytes_received,
	);

	return Json(UploadResponse {
		filename,
		bytes_received,
		stored_path: destination.to_string_lossy().to_string(),
	})
	.into_response();
}

//
// MARK: Client
//

/// The remote half of a resource node: verified download and upload
/// against a `FilesystemStoreServer` in another process, plus a local
/// staging directory.
pub struct FilesystemStoreClient {
	client_name: String,
	storage_directory: PathBuf,
	server_url: RwLock<Option<String>>,
	http: reqwest::Client,
}

impl FilesystemStoreClient {
	/// The client stages files under `<storage_directory>/<client_name>`.
	pub fn new(client_name: &str, storage_directory: impl Into<PathBuf>) -> Self {
		Self {
			client_name: client_name.into(),
			storage_directory: storage_directory.into().join(client_name),
			server_url: RwLock::new(None),
			// uploads can be arbitrarily large; no timeout
			http: reqwest::Client::new(),
		}
	}

	pub fn with_server_url(
		client_name: &str,
		storage_directory: impl Into<PathBuf>,
		server_url: &str,
	) -> Self {
		let client = Self::new(client_name, storage_directory);
		if let Ok(mut url) = client.server_url.write() {
			*url = Some(server_url.into());
		}
		client
	}

	pub fn storage_directory(&self) -> &Path {
		&self.storage_directory
	}

	fn endpoint(&self, path: &str) -> Result<String, RpcError> {
		match self.server_url.read().ok().and_then(|x| x.clone()) {
			Some(base) => Ok(format!("{base}/{path}")),
			None => Err(RpcError::NotConnected),
		}
	}

	/// Download an artifact into the staging directory, verifying its
	/// hash. Returns the local path.
	pub async fn get_artifact(&self, filepath: &str) -> Result<PathBuf, RpcError> {
		let url = self.endpoint(&format!("get_artifact/{filepath}"))?;
		let response = self.http.get(&url).send().await?;

		let status = response.status();
		if !status.is_success() {
			return Err(RpcError::Rejected {
				status: status.as_u16(),
				body: response.text().await.unwrap_or_default(),
			});
		}

		let expected_hash = response
			.headers()
			.get(FILE_HASH_HEADER)
			.and_then(|x| x.to_str().ok())
			.map(|x| x.to_owned());

		let local_path = self.storage_directory.join(filepath);
		if let Some(parent) = local_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let mut file = tokio::fs::File::create(&local_path).await?;
		let mut hasher = StreamHasher::new();
		let mut stream = response.bytes_stream();

		while let Some(chunk) = stream.next().await {
			let chunk = chunk?;
			hasher.update(&chunk);
			file.write_all(&chunk).await?;
		}
		file.flush().await?;
		drop(file);

		if let Some(expected) = expected_hash {
			let actual = hasher.finish();
			if actual != expected {
				let _ = tokio::fs::remove_file(&local_path).await;
				return Err(RpcError::HashMismatch { expected, actual });
			}
		}

		info!(
			message = "Downloaded artifact",
			client = self.client_name,
			filepath,
		);
		return Ok(local_path);
	}

	/// Upload a staged file to the server, which stores it at
	/// `remote_path` and records it into the active run. The file's hash
	/// travels in [`FILE_HASH_HEADER`]; the server verifies it before
	/// recording anything.
	pub async fn upload_file(
		&self,
		filepath: &str,
		remote_path: &str,
	) -> Result<UploadResponse, RpcError> {
		let local_path = self.storage_directory.join(filepath);
		if !local_path.is_file() {
			return Err(RpcError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("file not found: {}", local_path.display()),
			)));
		}

		let url = self.endpoint("upload_stream")?;
		let file_hash = hash_file(&local_path).await?;
		let filesize = tokio::fs::metadata(&local_path).await?.len();

		info!(
			message = "Uploading artifact",
			client = self.client_name,
			filepath,
			remote_path,
			bytes = filesize,
		);

		let file = tokio::fs::File::open(&local_path).await?;
		let stream = ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE);

		let response = self
			.http
			.post(&url)
			.header(FILENAME_HEADER, remote_path.trim_start_matches('/'))
			.header(FILE_HASH_HEADER, &file_hash)
			.header(CONTENT_TYPE, "application/octet-stream")
			.body(reqwest::Body::wrap_stream(stream))
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(RpcError::Rejected {
				status: status.as_u16(),
				body: response.text().await.unwrap_or_default(),
			});
		}

		return Ok(response.json().await?);
	}

	/// Resolve a staged artifact for local use.
	pub fn load_artifact(&self, filepath: &str) -> Result<PathBuf, RpcError> {
		let path = self.storage_directory.join(filepath);
		if !path.exists() {
			return Err(RpcError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("file not found: {}", path.display()),
			)));
		}
		return Ok(path);
	}
}

impl RpcClient for FilesystemStoreClient {
	fn client_name(&self) -> &str {
		&self.client_name
	}

	fn client_router(self: Arc<Self>) -> Router {
		Router::new()
			.route("/connect", post(fs_client_connect))
			.with_state(self)
	}
}

async fn fs_client_connect(
	State(client): State<Arc<FilesystemStoreClient>>,
	Json(server): Json<RpcConnectionModel>,
) -> Response {
	info!(
		message = "Server connected to filesystem client",
		client = client.client_name,
		server_url = server.url,
	);

	match client.server_url.write() {
		Ok(mut url) => *url = Some(server.url.clone()),
		Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
	}

	return Json(MessageResponse {
		message: format!(
			"client `{}` connected to server at `{}`",
			client.client_name, server.url
		),
	})
	.into_response();
}
