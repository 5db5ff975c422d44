use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use http::{Request, StatusCode};
use pebble_core::version::BuildInfo;
use tower::ServiceExt;

use super::*;
use crate::exec::CommandManager;
use crate::tasks::TaskRunner;

fn test_app() -> (Router, Arc<TaskRunner>) {
	let runner = TaskRunner::new();
	let commands = CommandManager::new(&runner);
	let daemon = Arc::new(Daemon {
		runner: runner.clone(),
		commands,
		build_info: BuildInfo::new(),
	});
	(router(daemon), runner)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
		.await
		.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn system_info_reports_build() {
	let (app, _runner) = test_app();
	let response = app
		.oneshot(
			Request::builder()
				.uri("/v1/system-info")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let info = body_json(response).await;
	assert!(info.get("name").is_some());
	assert!(info.get("version").is_some());
}

#[tokio::test]
async fn exec_rejects_invalid_requests() {
	let (app, _runner) = test_app();
	let response = app
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/v1/exec")
				.header("content-type", "application/json")
				.body(Body::from(
					r#"{"command":["/bin/true"],"interactive":true}"#,
				))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	let error = body_json(response).await;
	assert!(
		error["message"]
			.as_str()
			.unwrap()
			.contains("interactive mode without a terminal")
	);
}

#[tokio::test]
async fn exec_accepts_and_exposes_the_task() {
	let (app, runner) = test_app();
	let response = app
		.clone()
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/v1/exec")
				.header("content-type", "application/json")
				.body(Body::from(
					r#"{"command":["/bin/echo","hi"],"timeout":"5s","working-dir":"/"}"#,
				))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::ACCEPTED);
	let metadata = body_json(response).await;
	let task_id = metadata["task-id"].as_str().unwrap().to_string();
	assert_eq!(metadata["working-dir"], "/");
	assert!(metadata["environment"]["PATH"].is_string());

	let response = app
		.oneshot(
			Request::builder()
				.uri(format!("/v1/tasks/{task_id}"))
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let info = body_json(response).await;
	assert_eq!(info["id"], task_id.as_str());
	assert_eq!(info["kind"], "exec");
	assert!(info["spawn-time"].is_string());

	// The task exists in the runner as well.
	assert!(runner.get(&task_id).is_some());
}

#[tokio::test]
async fn unknown_task_is_not_found() {
	let (app, _runner) = test_app();
	let response = app
		.oneshot(
			Request::builder()
				.uri("/v1/tasks/999")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
