//! Remote command execution.
//!
//! A command runs as an `"exec"` task. Clients POST the request, then attach
//! up to three websockets named `control`, `stdio` and (with split stderr)
//! `stderr` to the task id. Once every I/O websocket is connected the child
//! is spawned with its streams bridged to the websockets; the exit code
//! lands on the task when it finishes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod execution;
mod pty;
mod ws;

pub use execution::{AttachError, WS_CONNECT_TIMEOUT};
pub use ws::{ControlMessage, ResizeArgs, SignalArgs};

use execution::{ExecSetup, Execution};

use crate::tasks::{Task, TaskHandler, TaskId, TaskRunner};

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;

pub const TASK_KIND_EXEC: &str = "exec";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_WIDTH: u16 = 80;
const DEFAULT_HEIGHT: u16 = 25;

/// Named websocket channels of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
	Control,
	Stdio,
	Stderr,
}

impl StreamId {
	pub fn as_str(&self) -> &'static str {
		match self {
			StreamId::Control => "control",
			StreamId::Stdio => "stdio",
			StreamId::Stderr => "stderr",
		}
	}
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for StreamId {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"control" => Ok(StreamId::Control),
			"stdio" => Ok(StreamId::Stdio),
			"stderr" => Ok(StreamId::Stderr),
			_ => Err(()),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
	#[error("cannot use interactive mode without a terminal")]
	InteractiveWithoutTerminal,

	#[error("no command specified")]
	EmptyCommand,

	#[error("cannot specify group-id without user-id")]
	GroupWithoutUser,

	#[error("cannot look up user id {0}: {1}")]
	UserLookup(u32, String),

	#[error("working directory {0:?} does not exist")]
	WorkingDirMissing(PathBuf),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
	#[error("unknown websocket stream {0:?}")]
	UnknownStream(String),

	#[error("task {0} is not an active execution")]
	NotRunning(TaskId),

	#[error("timed out waiting for execution to start")]
	Timeout,
}

/// Wire request for `POST /v1/exec`.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecRequest {
	pub command: Vec<String>,
	#[serde(default)]
	pub environment: HashMap<String, String>,
	#[serde(default)]
	pub working_dir: Option<PathBuf>,
	#[serde(default, with = "crate::serde_dur::option")]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub terminal: bool,
	#[serde(default)]
	pub interactive: bool,
	#[serde(default)]
	pub split_stderr: bool,
	#[serde(default)]
	pub width: Option<u16>,
	#[serde(default)]
	pub height: Option<u16>,
	#[serde(default)]
	pub user_id: Option<u32>,
	#[serde(default)]
	pub group_id: Option<u32>,
}

/// Returned to the client alongside the task id, with defaults resolved.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecMetadata {
	pub task_id: TaskId,
	pub environment: HashMap<String, String>,
	pub working_dir: PathBuf,
}

#[derive(Default)]
struct ManagerState {
	executions: HashMap<TaskId, Arc<Execution>>,
	waiters: HashMap<TaskId, Vec<oneshot::Sender<Arc<Execution>>>>,
	setups: HashMap<TaskId, ExecSetup>,
	shutdown: bool,
}

/// Owns every running execution, keyed by task id, and the rendezvous
/// between connecting websockets and the task handler.
pub struct CommandManager {
	runner: Arc<TaskRunner>,
	state: Mutex<ManagerState>,
}

impl CommandManager {
	/// Registers the `"exec"` task handler and the cleanup hook that clears
	/// per-task state once a task completes.
	pub fn new(runner: &Arc<TaskRunner>) -> Arc<Self> {
		let manager = Arc::new(CommandManager {
			runner: runner.clone(),
			state: Mutex::new(ManagerState::default()),
		});
		runner.add_handler(
			TASK_KIND_EXEC,
			Arc::new(ExecHandler {
				manager: Arc::downgrade(&manager),
			}),
		);
		let cleanup = Arc::downgrade(&manager);
		runner.add_cleanup(TASK_KIND_EXEC, move |task| {
			if let Some(manager) = cleanup.upgrade() {
				manager.remove(task.id());
			}
		});
		manager
	}

	/// Part of the manager lifecycle; command state has nothing to reconcile.
	pub fn ensure(&self) {}

	/// Validates the request, resolves environment and working directory
	/// defaults, and allocates the task. The caller starts the task.
	pub fn exec(&self, req: ExecRequest) -> Result<(Arc<Task>, ExecMetadata), ExecError> {
		if req.command.is_empty() {
			return Err(ExecError::EmptyCommand);
		}
		if req.interactive && !req.terminal {
			return Err(ExecError::InteractiveWithoutTerminal);
		}
		if req.group_id.is_some() && req.user_id.is_none() {
			return Err(ExecError::GroupWithoutUser);
		}

		let mut environment = req.environment.clone();
		if !environment.contains_key("PATH") {
			environment.insert("PATH".to_string(), DEFAULT_PATH.to_string());
		}
		if !environment.contains_key("LANG") {
			environment.insert("LANG".to_string(), "C.UTF-8".to_string());
		}

		let uid = req.user_id.unwrap_or_else(|| nix::unistd::geteuid().as_raw());
		let mut group_id = req.group_id;
		match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
			Ok(Some(user)) => {
				environment
					.entry("HOME".to_string())
					.or_insert_with(|| user.dir.to_string_lossy().into_owned());
				environment
					.entry("USER".to_string())
					.or_insert_with(|| user.name.clone());
				if req.user_id.is_some() && group_id.is_none() {
					group_id = Some(user.gid.as_raw());
				}
			},
			Ok(None) => {},
			Err(e) => return Err(ExecError::UserLookup(uid, e.to_string())),
		}

		let working_dir = match &req.working_dir {
			Some(dir) => dir.clone(),
			None => environment
				.get("HOME")
				.map(PathBuf::from)
				.unwrap_or_else(|| PathBuf::from("/")),
		};
		if !working_dir.is_dir() {
			return Err(ExecError::WorkingDirMissing(working_dir));
		}

		let setup = ExecSetup {
			command: req.command,
			environment: environment.clone(),
			working_dir: working_dir.clone(),
			timeout: req.timeout,
			terminal: req.terminal,
			interactive: req.interactive,
			split_stderr: req.split_stderr,
			width: req.width.unwrap_or(DEFAULT_WIDTH),
			height: req.height.unwrap_or(DEFAULT_HEIGHT),
			user_id: req.user_id,
			group_id,
		};

		let task = self.runner.new_task(TASK_KIND_EXEC);
		self
			.state
			.lock()
			.expect("manager state lock poisoned")
			.setups
			.insert(task.id().to_string(), setup);

		let metadata = ExecMetadata {
			task_id: task.id().to_string(),
			environment,
			working_dir,
		};
		Ok((task, metadata))
	}

	/// Upgrades the request to a websocket and attaches it to the named
	/// stream of the task's execution, waiting for the execution to appear
	/// if the handler has not registered it yet.
	pub async fn connect(
		&self,
		task: &Arc<Task>,
		stream: &str,
		upgrade: WebSocketUpgrade,
	) -> Result<Response, ConnectError> {
		let Ok(stream) = StreamId::from_str(stream) else {
			return Err(ConnectError::UnknownStream(stream.to_string()));
		};
		let execution = self.rendezvous(task).await?;
		let task_id = task.id().to_string();
		Ok(upgrade.on_upgrade(move |socket| async move {
			if let Err(e) = execution.attach(stream, socket) {
				warn!(task = %task_id, "websocket attach failed: {e}");
			}
		}))
	}

	async fn rendezvous(&self, task: &Arc<Task>) -> Result<Arc<Execution>, ConnectError> {
		let rx = {
			let mut state = self.state.lock().expect("manager state lock poisoned");
			if let Some(execution) = state.executions.get(task.id()) {
				return Ok(execution.clone());
			}
			if state.shutdown || task.is_ready() {
				return Err(ConnectError::NotRunning(task.id().to_string()));
			}
			let (tx, rx) = oneshot::channel();
			state
				.waiters
				.entry(task.id().to_string())
				.or_default()
				.push(tx);
			rx
		};
		tokio::select! {
			execution = rx => {
				execution.map_err(|_| ConnectError::NotRunning(task.id().to_string()))
			},
			_ = task.wait_ready() => Err(ConnectError::NotRunning(task.id().to_string())),
			_ = tokio::time::sleep(WS_CONNECT_TIMEOUT) => Err(ConnectError::Timeout),
		}
	}

	/// Drops the registry: pending `connect` calls fail promptly and no new
	/// executions are published.
	pub fn shutdown(&self) {
		let mut state = self.state.lock().expect("manager state lock poisoned");
		state.shutdown = true;
		state.waiters.clear();
	}

	fn take_setup(&self, task_id: &str) -> Option<ExecSetup> {
		self
			.state
			.lock()
			.expect("manager state lock poisoned")
			.setups
			.remove(task_id)
	}

	/// Publishes the execution and wakes every waiting `connect`.
	fn register(&self, task_id: &str, execution: Arc<Execution>) {
		let mut state = self.state.lock().expect("manager state lock poisoned");
		debug_assert!(
			!state.executions.contains_key(task_id),
			"duplicate execution for task {task_id}"
		);
		state
			.executions
			.insert(task_id.to_string(), execution.clone());
		for waiter in state.waiters.remove(task_id).unwrap_or_default() {
			let _ = waiter.send(execution.clone());
		}
	}

	fn remove(&self, task_id: &str) {
		let mut state = self.state.lock().expect("manager state lock poisoned");
		state.executions.remove(task_id);
		state.waiters.remove(task_id);
		state.setups.remove(task_id);
	}
}

struct ExecHandler {
	manager: Weak<CommandManager>,
}

#[async_trait]
impl TaskHandler for ExecHandler {
	async fn handle(&self, ctx: CancellationToken, task: Arc<Task>) -> anyhow::Result<()> {
		let Some(manager) = self.manager.upgrade() else {
			anyhow::bail!("command manager is gone");
		};
		let setup = manager
			.take_setup(task.id())
			.context("no exec setup for task")?;
		debug!(task = %task.id(), command = ?setup.command, "starting execution");
		let (execution, pending) = Execution::new(setup);
		manager.register(task.id(), execution.clone());
		// The cleanup hook deregisters once the task reaches a terminal state.
		execution.run(ctx, task.as_ref(), pending).await
	}
}
