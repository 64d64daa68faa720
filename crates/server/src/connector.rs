//! The per-node connector: the HTTP surface remote peers use to register
//! edges and deliver signals. Mounted at `/<node>/connector`.
//!
//! Every endpoint is non-blocking on the server side: it sets a latch (or
//! records an edge) and returns immediately.

use axum::{
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::post,
	Json, Router,
};
use std::sync::Arc;
use tracing::{debug, warn};

use weir_api::node::{MessageResponse, NodeConnectionModel};
use weir_pipeline::node::NodeCore;

pub(crate) fn router(core: Arc<NodeCore>) -> Router {
	Router::new()
		.route("/connect", post(connect))
		.route("/forward_signal", post(forward_signal))
		.route("/backward_signal", post(backward_signal))
		.with_state(core)
}

/// An upstream node registers itself as a remote predecessor.
/// We reply with our own model so the caller learns our shape.
async fn connect(
	State(core): State<Arc<NodeCore>>,
	Json(peer): Json<NodeConnectionModel>,
) -> Response {
	debug!(
		message = "Remote predecessor connecting",
		node = %core.name(),
		peer = %peer.node.name,
		peer_url = peer.node_url,
	);

	core.add_remote_predecessor(&peer.node_url);

	let reply = NodeConnectionModel {
		node: core.model(),
		node_url: core.node_url().unwrap_or_default().into(),
		result: None,
	};

	return Json(reply).into_response();
}

/// A remote predecessor signals this node.
async fn forward_signal(
	State(core): State<Arc<NodeCore>>,
	Json(peer): Json<NodeConnectionModel>,
) -> Response {
	if !core.set_predecessor_latch(&peer.node_url) {
		warn!(
			message = "Forward signal from unknown predecessor",
			node = %core.name(),
			peer_url = peer.node_url,
		);
		return (
			StatusCode::NOT_FOUND,
			format!("no predecessor registered at `{}`", peer.node_url),
		)
			.into_response();
	}

	return Json(MessageResponse {
		message: "Signalled successors".into(),
	})
	.into_response();
}

/// A remote successor acknowledges this node.
async fn backward_signal(
	State(core): State<Arc<NodeCore>>,
	Json(peer): Json<NodeConnectionModel>,
) -> Response {
	if !core.set_successor_latch(&peer.node_url) {
		warn!(
			message = "Backward signal from unknown successor",
			node = %core.name(),
			peer_url = peer.node_url,
		);
		return (
			StatusCode::NOT_FOUND,
			format!("no successor registered at `{}`", peer.node_url),
		)
			.into_response();
	}

	return Json(MessageResponse {
		message: "Signalled predecessors".into(),
	})
	.into_response();
}
