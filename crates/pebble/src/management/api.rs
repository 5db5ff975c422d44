//! The `/v1` API surface.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use pebble_core::version::BuildInfo;
use tracing::debug;

use crate::exec::{CommandManager, ConnectError, ExecRequest};
use crate::tasks::{Task, TaskRunner, TaskStatus};

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;

pub struct Daemon {
	pub runner: Arc<TaskRunner>,
	pub commands: Arc<CommandManager>,
	pub build_info: BuildInfo,
}

pub fn router(daemon: Arc<Daemon>) -> Router {
	Router::new()
		.route("/v1/system-info", get(system_info))
		.route("/v1/exec", post(post_exec))
		.route("/v1/tasks/{id}", get(get_task))
		.route("/v1/tasks/{id}/websocket/{stream}", get(task_websocket))
		.with_state(daemon)
}

#[derive(serde::Serialize)]
struct ApiError {
	message: String,
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
	(
		status,
		Json(ApiError {
			message: message.to_string(),
		}),
	)
		.into_response()
}

async fn system_info(State(daemon): State<Arc<Daemon>>) -> Json<BuildInfo> {
	Json(daemon.build_info.clone())
}

async fn post_exec(
	State(daemon): State<Arc<Daemon>>,
	Json(req): Json<ExecRequest>,
) -> Response {
	match daemon.commands.exec(req) {
		Ok((task, metadata)) => {
			debug!(task = %task.id(), "accepted exec request");
			daemon.runner.start(task);
			(StatusCode::ACCEPTED, Json(metadata)).into_response()
		},
		Err(e) => error_response(StatusCode::BAD_REQUEST, e),
	}
}

#[derive(serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct TaskInfo {
	id: String,
	kind: String,
	status: TaskStatus,
	spawn_time: chrono::DateTime<chrono::Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	ready_time: Option<chrono::DateTime<chrono::Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	api_data: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

impl TaskInfo {
	fn from_task(task: &Task) -> Self {
		TaskInfo {
			id: task.id().to_string(),
			kind: task.kind().to_string(),
			status: task.status(),
			spawn_time: task.spawn_time(),
			ready_time: task.ready_time(),
			api_data: task.api_data(),
			error: task.error(),
		}
	}
}

async fn get_task(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>) -> Response {
	match daemon.runner.get(&id) {
		Some(task) => Json(TaskInfo::from_task(&task)).into_response(),
		None => error_response(StatusCode::NOT_FOUND, format!("task {id:?} not found")),
	}
}

async fn task_websocket(
	State(daemon): State<Arc<Daemon>>,
	Path((id, stream)): Path<(String, String)>,
	upgrade: WebSocketUpgrade,
) -> Response {
	let Some(task) = daemon.runner.get(&id) else {
		return error_response(StatusCode::NOT_FOUND, format!("task {id:?} not found"));
	};
	match daemon.commands.connect(&task, &stream, upgrade).await {
		Ok(response) => response,
		Err(e @ ConnectError::UnknownStream(_)) => error_response(StatusCode::BAD_REQUEST, e),
		Err(e @ ConnectError::NotRunning(_)) => error_response(StatusCode::BAD_REQUEST, e),
		Err(e @ ConnectError::Timeout) => error_response(StatusCode::REQUEST_TIMEOUT, e),
	}
}
