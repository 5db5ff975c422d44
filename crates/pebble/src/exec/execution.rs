use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::StreamId;
use super::pty::{self, AsyncFdIo};
use super::ws;
use crate::serde_dur;
use crate::tasks::Task;

/// How long clients get to attach the I/O websockets before the task fails.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace for draining output mirrors after a force-kill.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Fully resolved parameters for one command, produced by
/// [`super::CommandManager::exec`].
#[derive(Debug, Clone)]
pub(crate) struct ExecSetup {
	pub command: Vec<String>,
	pub environment: HashMap<String, String>,
	pub working_dir: PathBuf,
	pub timeout: Option<Duration>,
	pub terminal: bool,
	pub interactive: bool,
	pub split_stderr: bool,
	pub width: u16,
	pub height: u16,
	pub user_id: Option<u32>,
	pub group_id: Option<u32>,
}

#[derive(thiserror::Error, Debug)]
pub enum AttachError {
	#[error("stream {0} not expected for this execution")]
	NotExpected(StreamId),
	#[error("stream {0} already connected")]
	AlreadyClaimed(StreamId),
	#[error("execution no longer accepts stream {0}")]
	Finished(StreamId),
}

enum Slot {
	Waiting(oneshot::Sender<WebSocket>),
	Claimed,
}

/// Per-task runtime state for one remote command.
///
/// Holds the registered websocket slots; the spawned child and its mirrors
/// live on the stack of [`Execution::run`].
pub(crate) struct Execution {
	setup: ExecSetup,
	streams: Mutex<HashMap<StreamId, Slot>>,
}

/// Receiving ends of the websocket slots, consumed by [`Execution::run`].
pub(crate) struct PendingStreams {
	stdio: oneshot::Receiver<WebSocket>,
	stderr: Option<oneshot::Receiver<WebSocket>>,
	control: oneshot::Receiver<WebSocket>,
}

impl Execution {
	pub fn new(setup: ExecSetup) -> (Arc<Self>, PendingStreams) {
		let (stdio_tx, stdio_rx) = oneshot::channel();
		let (control_tx, control_rx) = oneshot::channel();
		let mut streams = HashMap::from([
			(StreamId::Stdio, Slot::Waiting(stdio_tx)),
			(StreamId::Control, Slot::Waiting(control_tx)),
		]);
		let stderr_rx = if setup.split_stderr {
			let (tx, rx) = oneshot::channel();
			streams.insert(StreamId::Stderr, Slot::Waiting(tx));
			Some(rx)
		} else {
			None
		};
		(
			Arc::new(Execution {
				setup,
				streams: Mutex::new(streams),
			}),
			PendingStreams {
				stdio: stdio_rx,
				stderr: stderr_rx,
				control: control_rx,
			},
		)
	}

	/// Hands a freshly upgraded websocket to its slot. Each slot may be
	/// claimed exactly once.
	pub fn attach(&self, stream: StreamId, socket: WebSocket) -> Result<(), AttachError> {
		let mut streams = self.streams.lock().expect("stream map lock poisoned");
		match streams.get_mut(&stream) {
			None => Err(AttachError::NotExpected(stream)),
			Some(slot @ Slot::Waiting(_)) => {
				let Slot::Waiting(tx) = std::mem::replace(slot, Slot::Claimed) else {
					unreachable!()
				};
				tx.send(socket).map_err(|_| AttachError::Finished(stream))
			},
			Some(Slot::Claimed) => Err(AttachError::AlreadyClaimed(stream)),
		}
	}

	/// Drives the command: waits for the I/O websockets, spawns the child
	/// with wired streams, runs the mirrors and the control loop, and
	/// records the exit code on the task once all output has drained.
	pub async fn run(
		&self,
		ctx: CancellationToken,
		task: &Task,
		pending: PendingStreams,
	) -> anyhow::Result<()> {
		let PendingStreams {
			stdio,
			stderr,
			control,
		} = pending;

		// All I/O websockets must connect before anything is spawned.
		let io_wait = async {
			let stdio_ws = stdio.await.ok()?;
			let stderr_ws = match stderr {
				Some(rx) => Some(rx.await.ok()?),
				None => None,
			};
			Some((stdio_ws, stderr_ws))
		};
		let io_ready = tokio::select! {
			res = tokio::time::timeout(WS_CONNECT_TIMEOUT, io_wait) => res,
			_ = ctx.cancelled() => anyhow::bail!("execution cancelled"),
		};
		let Ok(connected) = io_ready else {
			anyhow::bail!(
				"timeout waiting for websocket connections after {}",
				serde_dur::format(WS_CONNECT_TIMEOUT)
			);
		};
		let Some((stdio_ws, stderr_ws)) = connected else {
			anyhow::bail!("websocket registration abandoned");
		};

		let wired = match self.spawn() {
			Ok(wired) => wired,
			Err(e) => {
				task.set_api_data(serde_json::json!({"exit-code": -1}));
				return Err(e).with_context(|| {
					format!("cannot start command {:?}", self.setup.command)
				});
			},
		};
		let Wired {
			mut child,
			stdout,
			stderr: stderr_reader,
			stdin,
			stdin_eof,
			resize_fd,
		} = wired;
		debug!(pid = ?child.id(), command = ?self.setup.command, "spawned command");

		// One mirror per stream direction; frame order on a websocket
		// follows from there being a single sender.
		let (mut stdio_tx, mut stdio_rx) = stdio_ws.split();
		let out_task = tokio::spawn(async move {
			if let Err(e) = ws::send_stream(&mut stdio_tx, stdout, None).await {
				debug!("stdio mirror ended: {e}");
			}
		});
		let in_task = tokio::spawn(async move {
			let res = match stdin_eof {
				Some(eof_char) => ws::recv_stream_tty(&mut stdio_rx, stdin, eof_char).await,
				None => ws::recv_stream(&mut stdio_rx, stdin).await,
			};
			if let Err(e) = res {
				debug!("stdin pump ended: {e}");
			}
		});
		let err_task = stderr_ws.map(|socket| {
			let reader = stderr_reader.expect("split stderr must be wired");
			let (mut tx, mut rx) = socket.split();
			tokio::spawn(async move {
				tokio::select! {
					res = ws::send_stream(&mut tx, reader, None) => {
						if let Err(e) = res {
							debug!("stderr mirror ended: {e}");
						}
					},
					_ = ws::drain(&mut rx) => {},
				}
			})
		});

		let done = CancellationToken::new();
		let pid = child.id().map(|pid| pid as i32);
		let control_task = tokio::spawn(control_loop(
			control,
			pid,
			resize_fd,
			self.setup.terminal,
			done.clone(),
		));

		enum Outcome {
			Exited(std::process::ExitStatus),
			TimedOut,
			Cancelled,
		}

		let outcome = tokio::select! {
			status = child.wait() => Outcome::Exited(status.context("wait for command")?),
			_ = sleep_opt(self.setup.timeout) => Outcome::TimedOut,
			_ = ctx.cancelled() => Outcome::Cancelled,
		};
		let killed = !matches!(outcome, Outcome::Exited(_));
		if killed {
			let _ = child.start_kill();
			let _ = child.wait().await;
		}
		// The child is gone either way; stop the control loop before it can
		// act on a pid that is no longer ours.
		done.cancel();

		// Exit status is not exposed until every output mirror has drained,
		// so a client that waits for the task and then reads the websocket
		// sees all the data. A force-killed command only gets a short grace.
		if killed {
			let drain = async {
				let _ = out_task.await;
				if let Some(err) = err_task {
					let _ = err.await;
				}
			};
			let _ = tokio::time::timeout(KILLED_OUTPUT_GRACE, drain).await;
		} else {
			let _ = out_task.await;
			if let Some(err) = err_task {
				let _ = err.await;
			}
		}
		in_task.abort();
		let _ = in_task.await;
		let _ = control_task.await;

		match outcome {
			Outcome::Exited(status) => {
				let code = exit_code(status);
				debug!(code, "command exited");
				task.set_api_data(serde_json::json!({"exit-code": code}));
				Ok(())
			},
			Outcome::TimedOut => {
				task.set_api_data(serde_json::json!({"exit-code": -1}));
				let timeout = self.setup.timeout.expect("timed out without a timeout");
				anyhow::bail!("timed out after {}", serde_dur::format(timeout))
			},
			Outcome::Cancelled => {
				task.set_api_data(serde_json::json!({"exit-code": -1}));
				anyhow::bail!("execution cancelled")
			},
		}
	}

	fn spawn(&self) -> anyhow::Result<Wired> {
		let setup = &self.setup;
		let mut cmd = Command::new(&setup.command[0]);
		cmd.args(&setup.command[1..]);
		// The environment is replaced, never inherited.
		cmd.env_clear();
		cmd.envs(&setup.environment);
		cmd.current_dir(&setup.working_dir);
		cmd.kill_on_drop(true);
		if let Some(uid) = setup.user_id {
			if uid != nix::unistd::geteuid().as_raw() {
				cmd.uid(uid);
			}
		}
		if let Some(gid) = setup.group_id {
			if gid != nix::unistd::getegid().as_raw() {
				cmd.gid(gid);
			}
		}

		let set_controlling_tty = setup.terminal && setup.interactive;
		unsafe {
			cmd.pre_exec(move || {
				if libc::setsid() < 0 {
					return Err(std::io::Error::last_os_error());
				}
				if set_controlling_tty {
					// stdin is the PTY slave; make it the controlling
					// terminal so ^C reaches the child as SIGINT.
					if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
						return Err(std::io::Error::last_os_error());
					}
				}
				Ok(())
			});
		}

		if setup.terminal {
			self.wire_terminal(cmd)
		} else {
			self.wire_pipes(cmd)
		}
	}

	fn wire_terminal(&self, mut cmd: Command) -> anyhow::Result<Wired> {
		let setup = &self.setup;
		let pty = pty::open(setup.width, setup.height).context("allocate pty")?;
		let resize_fd = pty::dup(pty.master.as_raw_fd()).context("dup pty master")?;
		let slave = pty.slave;

		cmd.stdout(Stdio::from(pty::dup_owned(&slave)?));
		let stderr_reader = if setup.split_stderr {
			let (err_r, err_w) = pty::pipe()?;
			cmd.stderr(Stdio::from(err_w));
			Some(Box::new(AsyncFdIo::new(err_r)?) as Box<dyn AsyncRead + Send + Unpin>)
		} else {
			cmd.stderr(Stdio::from(pty::dup_owned(&slave)?));
			None
		};

		let (master_read, master_write) = tokio::io::split(pty.master);
		let (stdin_sink, stdin_eof): (Box<dyn AsyncWrite + Send + Unpin>, Option<u8>) =
			if setup.interactive {
				cmd.stdin(Stdio::from(slave));
				(Box::new(master_write), Some(pty.eof_char))
			} else {
				let (in_r, in_w) = pty::pipe()?;
				cmd.stdin(Stdio::from(in_r));
				drop(slave);
				drop(master_write);
				(Box::new(AsyncFdIo::new(in_w)?), None)
			};

		let child = cmd.spawn()?;
		Ok(Wired {
			child,
			stdout: Box::new(master_read),
			stderr: stderr_reader,
			stdin: stdin_sink,
			stdin_eof,
			resize_fd: Some(resize_fd),
		})
	}

	fn wire_pipes(&self, mut cmd: Command) -> anyhow::Result<Wired> {
		let (out_r, out_w) = pty::pipe()?;
		let stderr_reader = if self.setup.split_stderr {
			let (err_r, err_w) = pty::pipe()?;
			cmd.stderr(Stdio::from(err_w));
			Some(Box::new(AsyncFdIo::new(err_r)?) as Box<dyn AsyncRead + Send + Unpin>)
		} else {
			// Merged stderr shares the stdout pipe, preserving write order.
			cmd.stderr(Stdio::from(pty::dup_owned(&out_w)?));
			None
		};
		cmd.stdout(Stdio::from(out_w));

		let (in_r, in_w) = pty::pipe()?;
		cmd.stdin(Stdio::from(in_r));

		let child = cmd.spawn()?;
		Ok(Wired {
			child,
			stdout: Box::new(AsyncFdIo::new(out_r)?),
			stderr: stderr_reader,
			stdin: Box::new(AsyncFdIo::new(in_w)?),
			stdin_eof: None,
			resize_fd: None,
		})
	}
}

struct Wired {
	child: Child,
	stdout: Box<dyn AsyncRead + Send + Unpin>,
	stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
	stdin: Box<dyn AsyncWrite + Send + Unpin>,
	/// `Some(VEOF)` when stdin feeds a PTY master: client EOF becomes the
	/// tty EOF character rather than a close.
	stdin_eof: Option<u8>,
	resize_fd: Option<OwnedFd>,
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
	match status.code() {
		Some(code) => code,
		// Killed by a signal; report it shell-style.
		None => 128 + status.signal().unwrap_or(0),
	}
}

async fn sleep_opt(timeout: Option<Duration>) {
	match timeout {
		Some(timeout) => tokio::time::sleep(timeout).await,
		None => std::future::pending().await,
	}
}

/// Dispatches control messages once the control websocket connects.
///
/// An abnormal close while the child runs is treated as the client going
/// away unexpectedly; the child gets SIGKILL.
async fn control_loop(
	socket_rx: oneshot::Receiver<WebSocket>,
	pid: Option<i32>,
	resize_fd: Option<OwnedFd>,
	terminal: bool,
	done: CancellationToken,
) {
	let socket = tokio::select! {
		socket = socket_rx => match socket {
			Ok(socket) => socket,
			Err(_) => return,
		},
		_ = done.cancelled() => return,
	};
	let (_tx, mut rx) = socket.split();
	loop {
		let event = tokio::select! {
			event = ws::next_control_event(&mut rx) => event,
			_ = done.cancelled() => return,
		};
		match event {
			ws::ControlEvent::Message(msg) => dispatch_control(&msg, pid, &resize_fd, terminal),
			ws::ControlEvent::ClosedNormally => return,
			ws::ControlEvent::ClosedAbnormally => {
				if !done.is_cancelled() {
					warn!("control websocket closed abnormally, killing command");
					signal_child(pid, Signal::SIGKILL);
				}
				return;
			},
		}
	}
}

fn dispatch_control(msg: &ws::ControlMessage, pid: Option<i32>, resize_fd: &Option<OwnedFd>, terminal: bool) {
	match msg.command.as_str() {
		"resize" => {
			if !terminal {
				warn!("ignoring resize for command without a terminal");
				return;
			}
			let Some(args) = &msg.resize else {
				warn!("resize command without arguments");
				return;
			};
			if let Some(fd) = resize_fd {
				use std::os::fd::AsRawFd;
				if let Err(e) = pty::resize(fd.as_raw_fd(), args.width, args.height) {
					warn!("cannot resize terminal: {e}");
				}
			}
		},
		"signal" => {
			let Some(args) = &msg.signal else {
				warn!("signal command without arguments");
				return;
			};
			match Signal::from_str(&args.name) {
				Ok(signal) => signal_child(pid, signal),
				Err(_) => warn!(name = %args.name, "unknown signal name"),
			}
		},
		other => warn!(command = %other, "unknown control command"),
	}
}

fn signal_child(pid: Option<i32>, signal: Signal) {
	let Some(pid) = pid else {
		return;
	};
	if let Err(e) = kill(Pid::from_raw(pid), signal) {
		debug!(pid, %signal, "cannot signal command: {e}");
	}
}
