//! Shared helpers for the server integration tests.

use async_trait::async_trait;
use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use weir_pipeline::{errors::HookError, node::Action};

pub const TICK: Duration = Duration::from_millis(25);
pub const PATIENCE: Duration = Duration::from_secs(20);

/// An action that counts its executions.
pub struct CountAction {
	pub executions: Arc<AtomicUsize>,
}

impl CountAction {
	pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
		let executions = Arc::new(AtomicUsize::new(0));
		let action = Arc::new(Self {
			executions: executions.clone(),
		});
		(action, executions)
	}
}

#[async_trait]
impl Action for CountAction {
	async fn execute(&self) -> Result<bool, HookError> {
		self.executions.fetch_add(1, Ordering::SeqCst);
		return Ok(true);
	}
}

/// Poll until `check` passes or time runs out.
pub async fn eventually<F>(what: &str, mut check: F)
where
	F: FnMut() -> bool,
{
	let deadline = Instant::now() + PATIENCE;
	while Instant::now() < deadline {
		if check() {
			return;
		}
		tokio::time::sleep(TICK).await;
	}
	panic!("timed out waiting for: {what}");
}
