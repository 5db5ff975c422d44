use tokio::sync::mpsc;

/// Waits for the process shutdown conditions: SIGINT/SIGTERM from the
/// operator, or a programmatic trigger from inside the daemon.
pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Blocks until a shutdown is requested.
	pub async fn wait(mut self) {
		imp::wait_for_signal(&mut self.shutdown_rx).await
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc;

	use tracing::info;

	pub(super) async fn wait_for_signal(rx: &mut mpsc::Receiver<()>) {
		let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM handler");
		let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT handler");
		tokio::select! {
			_ = sigterm.recv() => info!("received SIGTERM"),
			_ = sigint.recv() => info!("received SIGINT"),
			_ = rx.recv() => info!("received programmatic shutdown"),
		};
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc;

	use tracing::info;

	pub(super) async fn wait_for_signal(rx: &mut mpsc::Receiver<()>) {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
			_ = rx.recv() => info!("received programmatic shutdown"),
		};
	}
}
