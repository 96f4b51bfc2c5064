// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

/// Ready tracks whether the process has finished starting up.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a startup task; readiness is blocked until the returned
	/// handle is dropped.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.clone(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = crate::telemetry::APPLICATION_START_TIME
			.get()
			.map(|t| t.elapsed())
			.unwrap_or_default();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking process ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} tasks",
				self.name
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_when_all_tasks_drop() {
		let ready = Ready::new();
		assert!(ready.is_ready());

		let a = ready.register_task("store");
		let b = ready.register_task("servers");
		assert!(!ready.is_ready());
		assert_eq!(ready.pending().len(), 2);

		drop(a);
		assert!(!ready.is_ready());
		drop(b);
		assert!(ready.is_ready());
	}
}
