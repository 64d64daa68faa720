//! The federated graph as JSON, plus the small HTML fragments the
//! dashboard header uses. Real rendering lives outside this crate; these
//! fragments only carry enough structure for a client to toggle.

use weir_api::{
	labels::NodeLabel,
	pipeline::{FrontendEdge, FrontendGraph, FrontendNode},
};
use weir_pipeline::node::Node;

use crate::server::ServerState;

/// The last path segment of a remote node URL is that node's name.
pub(crate) fn remote_node_name(url: &str) -> NodeLabel {
	let trimmed = url.trim_end_matches('/');
	let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
	return NodeLabel::new(name);
}

/// Build the full federated graph: local nodes with their endpoints
/// filled in, local and remote edges, and every downstream pipeline's
/// fragment appended.
pub(crate) fn frontend_graph(state: &ServerState) -> FrontendGraph {
	let origin = state.origin();
	let model = state.pipeline.model();

	let mut nodes: Vec<FrontendNode> = Vec::new();
	let mut edges: Vec<FrontendEdge> = model
		.edges
		.iter()
		.map(|(source, target)| FrontendEdge {
			source: source.clone(),
			target: target.clone(),
		})
		.collect();

	for node_model in model.nodes {
		let id = node_model.name.clone();

		nodes.push(FrontendNode {
			id: id.clone(),
			label: id.clone(),
			origin_url: origin.clone(),
			endpoint: format!("{origin}/{id}/api/server"),
			header_bar_endpoint: format!("/header_bar?node_id={id}"),
			node: node_model,
		});
	}

	// remote edges point at the last path segment of the successor URL
	for node in state.pipeline.nodes() {
		for url in node.core().remote_successors() {
			edges.push(FrontendEdge {
				source: node.core().name().clone(),
				target: remote_node_name(url),
			});
		}
	}

	// splice in everything downstream advertised to us
	if let Ok(successors) = state.successor_models.lock() {
		for graph in successors.iter() {
			for remote in &graph.nodes {
				let mut remote = remote.clone();
				remote.header_bar_endpoint = format!("/header_bar?node_id={}", remote.id);
				nodes.push(remote);
			}
			edges.extend(graph.edges.iter().cloned());
		}
	}

	return FrontendGraph {
		name: state.name.clone(),
		nodes,
		edges,
	};
}

pub(crate) fn node_bar_invisible(node: &FrontendNode) -> String {
	format!(
		"<div id=\"{id}_header_bar\" class=\"node_header_bar\" hidden></div>",
		id = node.id,
	)
}

pub(crate) fn node_bar_closed(node: &FrontendNode) -> String {
	format!(
		concat!(
			"<div id=\"{id}_header_bar\" class=\"node_header_bar\">",
			"<a href=\"{endpoint}?node_id={id}&visibility=true\">{label}</a>",
			"</div>",
		),
		id = node.id,
		label = node.label,
		endpoint = "/header_bar",
	)
}

pub(crate) fn node_bar_open(node: &FrontendNode) -> String {
	format!(
		concat!(
			"<div id=\"{id}_header_bar\" class=\"node_header_bar open\">",
			"<a href=\"{endpoint}?node_id={id}&visibility=false\">{label}</a>",
			"<span class=\"node_type\">{node_type}</span>",
			"</div>",
		),
		id = node.id,
		label = node.label,
		node_type = node.node.node_type,
		endpoint = "/header_bar",
	)
}
