use std::fmt::Debug;

use tokio::sync::{mpsc, watch};

/// Creates a drain pair.
/// * `DrainTrigger` starts a drain and waits for it to complete.
/// * `DrainWatcher` is held (and cloned) by anything that wants to
///   participate in draining; a drain does not complete until every
///   outstanding watcher has been dropped or released.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (holder_tx, holder_rx) = mpsc::channel::<Never>(1);
	(
		DrainTrigger {
			signal_tx,
			holder_rx,
		},
		DrainWatcher {
			signal_rx,
			holder_tx,
		},
	)
}

enum Never {}

pub struct DrainTrigger {
	signal_tx: watch::Sender<bool>,
	holder_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
	/// Signals all watchers to drain and waits for every watcher handle to
	/// be dropped.
	pub async fn start_drain_and_wait(mut self) {
		let _ = self.signal_tx.send(true);
		match self.holder_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<bool>,
	holder_tx: mpsc::Sender<Never>,
}

/// Held after a drain has been observed; dropping it releases this
/// participant's hold on shutdown.
#[must_use = "dropping ReleaseShutdown releases the hold on shutdown"]
pub struct ReleaseShutdown(#[allow(dead_code)] mpsc::Sender<Never>);

impl DrainWatcher {
	/// Completes when a drain has been signaled. The returned handle keeps
	/// shutdown blocked until it is dropped.
	pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
		// An error means the trigger went away entirely; treat that as an
		// immediate drain.
		let _ = self.signal_rx.wait_for(|drained| *drained).await;
		ReleaseShutdown(self.holder_tx)
	}
}

impl Debug for DrainWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainWatcher").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let watcher = watcher.clone();
			let done = done.clone();
			tokio::spawn(async move {
				let release = watcher.wait_for_drain().await;
				tokio::time::sleep(Duration::from_millis(5)).await;
				done.fetch_add(1, Ordering::SeqCst);
				drop(release);
			});
		}
		drop(watcher);

		tokio::time::timeout(Duration::from_secs(1), trigger.start_drain_and_wait())
			.await
			.expect("drain should complete");
		assert_eq!(done.load(Ordering::SeqCst), 3);
	}
}
