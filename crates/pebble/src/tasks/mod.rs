//! Minimal task engine.
//!
//! Tracks units of asynchronous work the API hands out ids for. Handlers are
//! registered per task kind; cleanup hooks run when a task reaches a terminal
//! status, whatever the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "tasks_tests.rs"]
mod tests;

pub type TaskId = String;

#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
	Doing,
	Done,
	Error,
}

#[derive(Debug)]
struct TaskState {
	status: TaskStatus,
	api_data: Option<serde_json::Value>,
	error: Option<String>,
	ready_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Task {
	id: TaskId,
	kind: String,
	spawn_time: DateTime<Utc>,
	state: Mutex<TaskState>,
	ready: watch::Sender<bool>,
	cancel: CancellationToken,
}

impl Task {
	fn new(id: TaskId, kind: String) -> Arc<Self> {
		let (ready, _) = watch::channel(false);
		Arc::new(Task {
			id,
			kind,
			spawn_time: Utc::now(),
			state: Mutex::new(TaskState {
				status: TaskStatus::Doing,
				api_data: None,
				error: None,
				ready_time: None,
			}),
			ready,
			cancel: CancellationToken::new(),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn kind(&self) -> &str {
		&self.kind
	}

	pub fn spawn_time(&self) -> DateTime<Utc> {
		self.spawn_time
	}

	pub fn ready_time(&self) -> Option<DateTime<Utc>> {
		self
			.state
			.lock()
			.expect("task state lock poisoned")
			.ready_time
	}

	pub fn status(&self) -> TaskStatus {
		self.state.lock().expect("task state lock poisoned").status
	}

	pub fn error(&self) -> Option<String> {
		self
			.state
			.lock()
			.expect("task state lock poisoned")
			.error
			.clone()
	}

	/// Data exposed verbatim to API clients, e.g. `{"exit-code": 0}`.
	pub fn set_api_data(&self, data: serde_json::Value) {
		self.state.lock().expect("task state lock poisoned").api_data = Some(data);
	}

	pub fn api_data(&self) -> Option<serde_json::Value> {
		self
			.state
			.lock()
			.expect("task state lock poisoned")
			.api_data
			.clone()
	}

	/// Token cancelled when the task is aborted (daemon shutdown).
	pub fn cancellation(&self) -> CancellationToken {
		self.cancel.clone()
	}

	pub fn abort(&self) {
		self.cancel.cancel();
	}

	pub fn is_ready(&self) -> bool {
		*self.ready.borrow()
	}

	/// Resolves once the task has reached a terminal status.
	pub async fn wait_ready(&self) {
		let mut rx = self.ready.subscribe();
		let _ = rx.wait_for(|ready| *ready).await;
	}

	fn finish(&self, result: Result<(), anyhow::Error>) {
		{
			let mut state = self.state.lock().expect("task state lock poisoned");
			match result {
				Ok(()) => state.status = TaskStatus::Done,
				Err(e) => {
					state.status = TaskStatus::Error;
					state.error = Some(format!("{e:#}"));
				},
			}
			state.ready_time = Some(Utc::now());
		}
		let _ = self.ready.send(true);
	}
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
	async fn handle(&self, ctx: CancellationToken, task: Arc<Task>) -> anyhow::Result<()>;
}

type CleanupFn = Box<dyn Fn(&Task) + Send + Sync>;

/// Dispatches tasks to their kind's handler on the tokio runtime.
pub struct TaskRunner {
	handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
	cleanups: Mutex<HashMap<String, Vec<CleanupFn>>>,
	tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
	next_id: AtomicU64,
}

impl Default for TaskRunner {
	fn default() -> Self {
		TaskRunner {
			handlers: Mutex::new(HashMap::new()),
			cleanups: Mutex::new(HashMap::new()),
			tasks: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
		}
	}
}

impl TaskRunner {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn add_handler(&self, kind: &str, handler: Arc<dyn TaskHandler>) {
		let previous = self
			.handlers
			.lock()
			.expect("handlers lock poisoned")
			.insert(kind.to_string(), handler);
		debug_assert!(previous.is_none(), "duplicate handler for task kind {kind}");
	}

	/// Runs after a task of this kind reaches a terminal status, regardless
	/// of outcome. Used to drop per-task scratch state.
	pub fn add_cleanup(&self, kind: &str, f: impl Fn(&Task) + Send + Sync + 'static) {
		self
			.cleanups
			.lock()
			.expect("cleanups lock poisoned")
			.entry(kind.to_string())
			.or_default()
			.push(Box::new(f));
	}

	/// Allocates and registers a new task in `Doing` state.
	pub fn new_task(&self, kind: &str) -> Arc<Task> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
		let task = Task::new(id.clone(), kind.to_string());
		self
			.tasks
			.lock()
			.expect("tasks lock poisoned")
			.insert(id, task.clone());
		task
	}

	pub fn get(&self, id: &str) -> Option<Arc<Task>> {
		self
			.tasks
			.lock()
			.expect("tasks lock poisoned")
			.get(id)
			.cloned()
	}

	/// Drives the task to completion on a background tokio task.
	pub fn start(self: &Arc<Self>, task: Arc<Task>) {
		let handler = self
			.handlers
			.lock()
			.expect("handlers lock poisoned")
			.get(task.kind())
			.cloned();
		let runner = self.clone();
		tokio::spawn(async move {
			let result = match handler {
				Some(handler) => {
					handler
						.handle(task.cancellation(), task.clone())
						.await
				},
				None => Err(anyhow::anyhow!("no handler for task kind {:?}", task.kind())),
			};
			if let Err(e) = &result {
				warn!(task = %task.id(), "task failed: {e:#}");
			} else {
				debug!(task = %task.id(), "task done");
			}
			task.finish(result);
			runner.run_cleanups(&task);
		});
	}

	fn run_cleanups(&self, task: &Task) {
		let cleanups = self.cleanups.lock().expect("cleanups lock poisoned");
		if let Some(hooks) = cleanups.get(task.kind()) {
			for hook in hooks {
				hook(task);
			}
		}
	}

	/// Aborts every task still running.
	pub fn shutdown(&self) {
		let tasks = self.tasks.lock().expect("tasks lock poisoned");
		for task in tasks.values() {
			if task.status() == TaskStatus::Doing {
				task.abort();
			}
		}
	}
}
