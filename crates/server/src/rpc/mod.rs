//! The per-node RPC surface: servers mounted under `/<node>/api/server`,
//! and the clients that call them from another process.

use axum::Router;
use std::sync::Arc;
use thiserror::Error;

pub mod metadata;
pub mod resource;

pub use metadata::MetadataStoreClient;
pub use resource::FilesystemStoreClient;

/// An error from an RPC client call.
#[derive(Debug, Error)]
pub enum RpcError {
	/// The client was called before a server connected to it
	#[error("network connection has not been established yet")]
	NotConnected,

	#[error("i/o error")]
	Io(#[from] std::io::Error),

	#[error("transport error")]
	Transport(#[from] reqwest::Error),

	/// The server answered with an error status
	#[error("server replied with status {status}: {body}")]
	Rejected { status: u16, body: String },

	/// A transferred file failed hash verification
	#[error("file hash mismatch: expected {expected}, got {actual}")]
	HashMismatch { expected: String, actual: String },
}

/// A remote RPC client hosted by this pipeline server.
///
/// Clients are mounted at `/<client>/api/client`; their `/connect`
/// endpoint is how a node server in another process announces where it
/// lives.
pub trait RpcClient: Send + Sync {
	fn client_name(&self) -> &str;

	/// The router to mount at this client's prefix.
	fn client_router(self: Arc<Self>) -> Router;

	/// Is this a metadata store client? At most one of those may be
	/// mounted per server.
	fn is_metadata(&self) -> bool {
		false
	}
}
