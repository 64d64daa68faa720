//! The edge-level wake primitive.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A one-shot, re-armable latch.
///
/// Every directed edge between two nodes gets one of these: the source
/// `set()`s it, the target `wait()`s on it and `clear()`s it once woken.
/// `set()` is idempotent, and a `set()` that races a `wait()` is never
/// lost: waiters re-check the flag after every wake-up.
pub struct Latch {
	flag: AtomicBool,
	notify: Notify,
}

impl Latch {
	/// Make a new, unset latch
	pub fn new() -> Self {
		Self {
			flag: AtomicBool::new(false),
			notify: Notify::new(),
		}
	}

	/// Make a new latch that starts set
	pub fn new_set() -> Self {
		Self {
			flag: AtomicBool::new(true),
			notify: Notify::new(),
		}
	}

	/// Set this latch, waking every current and future waiter.
	pub fn set(&self) {
		if !self.flag.swap(true, Ordering::SeqCst) {
			self.notify.notify_waiters();
		}
	}

	/// Re-arm this latch.
	pub fn clear(&self) {
		self.flag.store(false, Ordering::SeqCst);
	}

	/// Is this latch currently set?
	pub fn is_set(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}

	/// Block until this latch is set.
	/// Returns immediately if it already is.
	pub async fn wait(&self) {
		loop {
			// Register interest before checking the flag,
			// otherwise a set() between the check and the await is lost.
			let notified = self.notify.notified();
			if self.flag.load(Ordering::SeqCst) {
				return;
			}
			notified.await;
		}
	}
}

impl std::fmt::Debug for Latch {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Latch").field("set", &self.is_set()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{sync::Arc, time::Duration};

	#[tokio::test]
	async fn wait_returns_if_already_set() {
		let l = Latch::new();
		l.set();
		l.wait().await;
		assert!(l.is_set());
	}

	#[tokio::test]
	async fn set_wakes_a_blocked_waiter() {
		let l = Arc::new(Latch::new());

		let waiter = {
			let l = l.clone();
			tokio::spawn(async move { l.wait().await })
		};

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!waiter.is_finished());

		l.set();
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn clear_rearms() {
		let l = Arc::new(Latch::new());
		l.set();
		l.wait().await;
		l.clear();
		assert!(!l.is_set());

		let waiter = {
			let l = l.clone();
			tokio::spawn(async move { l.wait().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!waiter.is_finished());

		l.set();
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn set_is_idempotent() {
		let l = Latch::new();
		l.set();
		l.set();
		l.wait().await;
	}
}
