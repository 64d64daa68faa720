//! The action node: runs user work inside a run and reports the outcome.

use async_trait::async_trait;
use futures::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::error;

use weir_api::status::{BaseType, NodeResult, NodeStatus};

use super::{Node, NodeCore, NodeOptions};
use crate::errors::HookError;

/// The work an action node performs, plus its life-cycle hooks.
///
/// Every hook is optional except [`Action::execute`]. Hook errors and
/// panics are captured and logged; they never corrupt the handshake, and
/// `after_execution` always runs.
#[async_trait]
pub trait Action: Send + Sync + 'static {
	/// One-time setup before the node's loop starts.
	async fn setup(&self) -> Result<(), HookError> {
		Ok(())
	}

	/// Runs before each execution.
	async fn before_execution(&self) -> Result<(), HookError> {
		Ok(())
	}

	/// The work itself. `Ok(true)` is success, `Ok(false)` is failure,
	/// `Err` (or a panic) is an error.
	async fn execute(&self) -> Result<bool, HookError>;

	/// Runs after each execution, whatever its outcome.
	async fn after_execution(&self) -> Result<(), HookError> {
		Ok(())
	}

	async fn on_success(&self) -> Result<(), HookError> {
		Ok(())
	}

	async fn on_failure(&self) -> Result<(), HookError> {
		Ok(())
	}

	async fn on_error(&self, _error: &HookError) -> Result<(), HookError> {
		Ok(())
	}
}

/// A node that executes a user [`Action`] once per run.
pub struct ActionNode {
	core: Arc<NodeCore>,
	action: Arc<dyn Action>,
}

impl ActionNode {
	pub fn new(
		name: &str,
		node_type: &str,
		action: Arc<dyn Action>,
		options: NodeOptions,
	) -> Self {
		Self {
			core: Arc::new(NodeCore::new(name, node_type, BaseType::Action, options)),
			action,
		}
	}

	pub fn action(&self) -> Arc<dyn Action> {
		self.action.clone()
	}

	/// Run one hook, capturing errors and panics.
	async fn run_hook<F>(&self, hook: &str, fut: F)
	where
		F: Future<Output = Result<(), HookError>>,
	{
		match AssertUnwindSafe(fut).catch_unwind().await {
			Ok(Ok(())) => {}
			Ok(Err(error)) => {
				error!(
					message = "Error in user-defined hook",
					node = %self.core.name(),
					hook,
					%error,
				);
			}
			Err(_) => {
				error!(
					message = "User-defined hook panicked",
					node = %self.core.name(),
					hook,
				);
			}
		}
	}
}

#[async_trait]
impl Node for ActionNode {
	fn core(&self) -> &Arc<NodeCore> {
		&self.core
	}

	async fn setup(&self) -> Result<(), HookError> {
		self.action.setup().await
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
		self
	}

	async fn run_loop(self: Arc<Self>) {
		let core = self.core.clone();

		core.await_connection().await;

		while !core.exiting() {
			core.wait_if_paused().await;

			core.set_status(NodeStatus::WaitingPredecessors);
			core.wait_for_predecessors().await;
			if core.exiting() {
				break;
			}

			core.set_status(NodeStatus::Preparation);
			self.run_hook("before_execution", self.action.before_execution())
				.await;
			if core.exiting() {
				break;
			}

			core.set_status(NodeStatus::Executing);
			let succeeded = match AssertUnwindSafe(self.action.execute()).catch_unwind().await {
				Ok(Ok(true)) => {
					core.set_status(NodeStatus::Complete);
					self.run_hook("on_success", self.action.on_success()).await;
					true
				}
				Ok(Ok(false)) => {
					core.set_status(NodeStatus::Failure);
					self.run_hook("on_failure", self.action.on_failure()).await;
					false
				}
				Ok(Err(error)) => {
					error!(
						message = "Error executing node",
						node = %core.name(),
						%error,
					);
					core.set_status(NodeStatus::Error);
					self.run_hook("on_error", self.action.on_error(&error)).await;
					false
				}
				Err(_) => {
					error!(message = "Node execution panicked", node = %core.name());
					core.set_status(NodeStatus::Error);
					let error: HookError = "execute panicked".into();
					self.run_hook("on_error", self.action.on_error(&error)).await;
					false
				}
			};

			// after_execution runs whatever happened above
			core.set_status(NodeStatus::Cleanup);
			self.run_hook("after_execution", self.action.after_execution())
				.await;
			if core.exiting() {
				break;
			}

			let result = if succeeded {
				NodeResult::Success
			} else {
				NodeResult::Failure
			};

			core.signal_successors(result).await;
			if core.exiting() {
				break;
			}

			// waiting for successor acknowledgements before signalling
			// predecessors is what keeps the whole run window open until
			// every action downstream of us is done with it
			core.set_status(NodeStatus::WaitingSuccessors);
			core.wait_for_successors().await;
			if core.exiting() {
				break;
			}

			core.signal_predecessors(result).await;
		}
	}
}
