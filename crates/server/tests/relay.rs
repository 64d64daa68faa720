//! Relay backpressure: producers never block, the pending buffer is
//! bounded and drops oldest, and fresh events flow once the upstream
//! comes back.

mod common;

use axum::{extract::State, routing::post, Json, Router};
use std::{
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use common::eventually;
use weir_api::{event::EventModel, labels::NodeLabel, status::NodeStatus};
use weir_pipeline::{
	node::{ActionNode, Node, NodeOptions},
	pipeline::Pipeline,
};
use weir_server::PipelineServer;

/// A stand-in upstream that records every relayed event.
async fn start_upstream_sink(port: u16) -> Arc<Mutex<Vec<EventModel>>> {
	let received: Arc<Mutex<Vec<EventModel>>> = Arc::new(Mutex::new(Vec::new()));

	async fn sink(
		State(received): State<Arc<Mutex<Vec<EventModel>>>>,
		Json(event): Json<EventModel>,
	) -> Json<serde_json::Value> {
		received.lock().unwrap().push(event);
		Json(serde_json::json!({"status": "ok"}))
	}

	let app = Router::new()
		.route("/send_event", post(sink))
		.with_state(received.clone());

	let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	received
}

#[tokio::test]
async fn flooding_a_dead_upstream_never_blocks_and_recovers() {
	// a node blocked on a phantom remote predecessor keeps the pipeline
	// quiet while we drive the bus by hand
	let (action, _) = common::CountAction::new();
	let act = Arc::new(ActionNode::new(
		"act",
		"CountAction",
		action,
		NodeOptions {
			remote_predecessors: vec!["http://127.0.0.1:1/phantom".into()],
			..Default::default()
		},
	));

	let nodes: Vec<Arc<dyn Node>> = vec![act];
	let pipeline = Pipeline::new("chatty", nodes).unwrap();
	let server = PipelineServer::new("chatty", "127.0.0.1", 0, pipeline, Vec::new())
		.unwrap()
		.start()
		.await
		.unwrap();

	// reserve a port for the future upstream, then leave it dead
	let upstream_port = {
		let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		probe.local_addr().unwrap().port()
	};

	let http = reqwest::Client::new();
	http.post(format!("{}/connect", server.origin()))
		.json(&weir_api::pipeline::PipelineConnectionModel {
			predecessor_host: "127.0.0.1".into(),
			predecessor_port: upstream_port,
		})
		.send()
		.await
		.unwrap();
	http.post(format!("{}/finish_connect", server.origin()))
		.send()
		.await
		.unwrap();

	// flood the bus while the upstream is unreachable; pushes are
	// synchronous and must never block on the dead relay
	let flood_start = Instant::now();
	for i in 0..5000u32 {
		server
			.bus()
			.push_status(&NodeLabel::new(&format!("n{i}")), NodeStatus::Triggered);
	}
	assert!(
		flood_start.elapsed() < Duration::from_secs(2),
		"producers were blocked by the dead upstream"
	);

	// give the relay a moment to hit the dead port and mark itself
	// disconnected
	tokio::time::sleep(Duration::from_millis(300)).await;

	// the upstream comes back, and the server reconnects
	let received = start_upstream_sink(upstream_port).await;
	http.post(format!("{}/finish_connect", server.origin()))
		.send()
		.await
		.unwrap();

	// a fresh event flows through
	server
		.bus()
		.push_status(&NodeLabel::new("fresh"), NodeStatus::Complete);

	{
		let received = received.clone();
		eventually("the fresh event to reach the upstream", move || {
			received
				.lock()
				.unwrap()
				.iter()
				.any(|e| e.data.contains("\"fresh\""))
		})
		.await;
	}

	// the flood was bounded: most of it was dropped, oldest first
	let events = received.lock().unwrap();
	assert!(
		events.len() <= 2048,
		"relay delivered {} events; the pending buffer is not bounded",
		events.len()
	);
	assert!(
		!events.iter().any(|e| e.data.contains("\"n0\"")),
		"the oldest flood event survived; drop order is wrong"
	);

	drop(events);
	server.shutdown().await;
}
