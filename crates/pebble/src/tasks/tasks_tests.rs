use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::*;

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
	async fn handle(&self, _ctx: CancellationToken, task: Arc<Task>) -> anyhow::Result<()> {
		task.set_api_data(serde_json::json!({"echo": task.id()}));
		Ok(())
	}
}

struct Fail;

#[async_trait]
impl TaskHandler for Fail {
	async fn handle(&self, _ctx: CancellationToken, _task: Arc<Task>) -> anyhow::Result<()> {
		anyhow::bail!("boom")
	}
}

struct Hang;

#[async_trait]
impl TaskHandler for Hang {
	async fn handle(&self, ctx: CancellationToken, _task: Arc<Task>) -> anyhow::Result<()> {
		ctx.cancelled().await;
		anyhow::bail!("cancelled")
	}
}

#[tokio::test]
async fn handler_drives_task_to_done() {
	let runner = TaskRunner::new();
	runner.add_handler("echo", Arc::new(Echo));

	let task = runner.new_task("echo");
	assert_eq!(task.status(), TaskStatus::Doing);
	runner.start(task.clone());
	task.wait_ready().await;

	assert_eq!(task.status(), TaskStatus::Done);
	assert_eq!(
		task.api_data(),
		Some(serde_json::json!({"echo": task.id()}))
	);
	assert!(runner.get(task.id()).is_some());
}

#[tokio::test]
async fn handler_error_marks_task_failed() {
	let runner = TaskRunner::new();
	runner.add_handler("fail", Arc::new(Fail));

	let task = runner.new_task("fail");
	runner.start(task.clone());
	task.wait_ready().await;

	assert_eq!(task.status(), TaskStatus::Error);
	assert!(task.error().unwrap().contains("boom"));
}

#[tokio::test]
async fn unknown_kind_fails() {
	let runner = TaskRunner::new();
	let task = runner.new_task("mystery");
	runner.start(task.clone());
	task.wait_ready().await;
	assert_eq!(task.status(), TaskStatus::Error);
}

#[tokio::test]
async fn cleanup_runs_on_every_outcome() {
	let runner = TaskRunner::new();
	runner.add_handler("echo", Arc::new(Echo));
	runner.add_handler("fail", Arc::new(Fail));
	let count = Arc::new(AtomicUsize::new(0));
	for kind in ["echo", "fail"] {
		let count = count.clone();
		runner.add_cleanup(kind, move |_| {
			count.fetch_add(1, Ordering::SeqCst);
		});
	}

	for kind in ["echo", "fail"] {
		let task = runner.new_task(kind);
		runner.start(task.clone());
		task.wait_ready().await;
	}
	assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_aborts_running_tasks() {
	let runner = TaskRunner::new();
	runner.add_handler("hang", Arc::new(Hang));
	let task = runner.new_task("hang");
	runner.start(task.clone());

	runner.shutdown();
	task.wait_ready().await;
	assert_eq!(task.status(), TaskStatus::Error);
}
