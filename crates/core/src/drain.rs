use tokio::sync::{mpsc, watch};

/// Creates a drain pair. The trigger starts a drain and waits for every
/// watcher (and clone thereof) to acknowledge by dropping.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (drain_tx, drain_rx) = watch::channel(false);
	let (ack_tx, ack_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger {
			drain_tx,
			ack_rx,
		},
		DrainWatcher {
			drain_rx,
			_ack: ack_tx,
		},
	)
}

#[derive(Debug)]
pub struct DrainTrigger {
	drain_tx: watch::Sender<bool>,
	ack_rx: mpsc::Receiver<()>,
}

impl DrainTrigger {
	/// Signals all watchers to drain and blocks until they have all dropped.
	pub async fn start_drain_and_wait(mut self) {
		let _ = self.drain_tx.send(true);
		// Every watcher holds a sender clone; recv returns None once all are gone.
		let _ = self.ack_rx.recv().await;
	}
}

#[derive(Debug, Clone)]
pub struct DrainWatcher {
	drain_rx: watch::Receiver<bool>,
	_ack: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Resolves when a drain has been requested. The watcher should be dropped
	/// promptly afterwards so the trigger can complete.
	pub async fn wait_for_drain(mut self) {
		let _ = self.drain_rx.wait_for(|draining| *draining).await;
	}
}
