//! Errors we may encounter while starting or federating a pipeline server.

use thiserror::Error;
use weir_api::labels::NodeLabel;
use weir_pipeline::node::MetadataError;

/// An error that aborts pipeline server startup.
///
/// Connect-phase failures are deliberately fatal: a pipeline that cannot
/// wire its federation cannot run.
#[derive(Debug, Error)]
pub enum ServerError {
	#[error("could not bind listener")]
	Bind(#[from] std::io::Error),

	/// A connect-phase HTTP call failed outright
	#[error("could not reach `{url}` while connecting")]
	Unreachable {
		url: String,
		#[source]
		source: reqwest::Error,
	},

	/// A connect-phase HTTP call was answered with an error status
	#[error("`{url}` rejected connection with status {status}")]
	Rejected { url: String, status: u16 },

	/// A remote successor URL names a node its server never advertised
	#[error("node `{node}` has remote successor `{url}`, which no downstream pipeline advertises")]
	UnknownRemoteNode { node: NodeLabel, url: String },

	/// A cross-process edge violates the archetype adjacency rules
	#[error("invalid connection: {message}")]
	InvalidRemoteEdge { message: String },

	/// A remote successor URL could not be parsed
	#[error("invalid remote successor url `{url}`")]
	BadRemoteUrl { url: String },

	/// Only one metadata store client may be mounted per server
	#[error("only one metadata store client is allowed per pipeline server")]
	MultipleMetadataClients,

	/// The local metadata store failed while registering remote nodes
	#[error("metadata store error during connect")]
	Metadata(#[from] MetadataError),
}
