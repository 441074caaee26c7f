//! HTTP request handlers for the REST API.
//!
//! Handlers validate, dispatch into the orchestrator, and shape responses.
//! Long-running work (VM boot) is detached by the orchestrator; `POST /tasks`
//! answers immediately with status `starting`.

use std::{convert::Infallible, path::PathBuf};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use uuid::Uuid;

use crate::{
    hub::WsEvent,
    orchestration::ProvisionRequest,
    store::TaskConfig,
    utils::read_last_lines,
    LiaResult,
};

use super::{
    state::AppState,
    types::{
        CreateTaskRequest, ListTasksQuery, LogsQuery, LogsResponse, StreamLogsQuery,
        TaskListResponse, TaskResponse,
    },
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for the GET /health endpoint.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Handler for the POST /api/v1/tasks endpoint.
///
/// Inserts the task, kicks off the detached boot pipeline, and returns the row
/// immediately with status `starting`.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> LiaResult<Json<TaskResponse>> {
    request.validate()?;

    let orchestrator = state.orchestrator();
    let store = orchestrator.store();
    let config = orchestrator.config();

    let user_id = request
        .user_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());

    let task = store
        .create(
            &user_id,
            request.source,
            &request.repositories,
            request.config.clone(),
            request.guild_id.as_deref(),
        )
        .await?;

    let task_config = request.config.clone().unwrap_or(TaskConfig {
        timeout_minutes: TaskConfig::default().timeout_minutes,
        max_memory_mb: config.vm.default_memory_mb,
        vcpu_count: config.vm.default_vcpu_count,
        storage_gb: config.vm.default_storage_gb,
    });

    orchestrator
        .start_task(
            &task,
            ProvisionRequest {
                prompt: request.prompt,
                files: request.files,
                task_config,
                ssh_public_key: request.ssh_public_key,
            },
        )
        .await?;

    let task = store.get(task.id).await?;
    let guild_id = store.group_id_for(task.id).await?;
    Ok(Json(TaskResponse::from_task(
        task,
        guild_id,
        &config.server.web_url,
    )))
}

/// Handler for the GET /api/v1/tasks/{id} endpoint.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> LiaResult<Json<TaskResponse>> {
    let store = state.orchestrator().store();
    let task = store.get(id).await?;
    let guild_id = store.group_id_for(id).await?;
    Ok(Json(TaskResponse::from_task(
        task,
        guild_id,
        &state.orchestrator().config().server.web_url,
    )))
}

/// Handler for the GET /api/v1/tasks endpoint.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> LiaResult<Json<TaskListResponse>> {
    let store = state.orchestrator().store();
    let web_url = &state.orchestrator().config().server.web_url;

    let (tasks, total) = store
        .list(query.user_id.as_deref(), query.status, query.page, query.per_page)
        .await?;

    let mut responses = Vec::with_capacity(tasks.len());
    for task in tasks {
        let guild_id = store.group_id_for(task.id).await?;
        responses.push(TaskResponse::from_task(task, guild_id, web_url));
    }

    Ok(Json(TaskListResponse {
        tasks: responses,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

/// Handler for the DELETE /api/v1/tasks/{id} endpoint.
///
/// Terminates the task and its VM. The row is retained in terminal state.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> LiaResult<impl IntoResponse> {
    state.orchestrator().terminate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for the POST /api/v1/tasks/{id}/resume endpoint.
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> LiaResult<Json<TaskResponse>> {
    let task = state.orchestrator().resume(id).await?;
    let guild_id = state.orchestrator().store().group_id_for(id).await?;
    Ok(Json(TaskResponse::from_task(
        task,
        guild_id,
        &state.orchestrator().config().server.web_url,
    )))
}

/// Handler for the GET /api/v1/tasks/{id}/output endpoint.
///
/// Returns the buffered output events for a task, oldest first.
pub async fn get_task_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> LiaResult<Json<Vec<WsEvent>>> {
    let _ = state.orchestrator().store().get(id).await?;

    let events = match state.orchestrator().hubs().get(id).await {
        Some(hub) => hub.replay(),
        None => vec![],
    };

    Ok(Json(events))
}

/// Handler for the GET /api/v1/tasks/{id}/logs endpoint.
///
/// Returns the last `tail` lines of the hypervisor log.
pub async fn get_vm_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogsQuery>,
) -> LiaResult<Json<LogsResponse>> {
    let _ = state.orchestrator().store().get(id).await?;

    let log_path = vm_log_path(&state, id);
    let (lines, total_lines) = read_last_lines(&log_path, params.tail).await?;

    Ok(Json(LogsResponse {
        task_id: id,
        lines,
        total_lines,
    }))
}

/// Handler for the GET /api/v1/tasks/{id}/logs/stream endpoint.
///
/// Streams the hypervisor log over SSE like `tail -f`: the last `tail` lines
/// up front, then new content as it is written, with a heartbeat every thirty
/// seconds.
pub async fn stream_vm_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<StreamLogsQuery>,
) -> LiaResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let _ = state.orchestrator().store().get(id).await?;

    let log_path = vm_log_path(&state, id);

    let stream = async_stream::stream! {
        let init = serde_json::json!({ "task_id": id.to_string(), "tail": params.tail });
        yield Ok(Event::default().event("init").data(init.to_string()));

        match read_last_lines(&log_path, params.tail).await {
            Ok((lines, _)) => {
                for line in lines {
                    let data = serde_json::json!({ "line": format!("{}\n", line) });
                    yield Ok(Event::default().event("log").data(data.to_string()));
                }
            }
            Err(e) => {
                let data = serde_json::json!({ "error": format!("failed to read log: {}", e) });
                yield Ok(Event::default().event("error").data(data.to_string()));
                return;
            }
        }

        let file = match tokio::fs::File::open(&log_path).await {
            Ok(file) => file,
            Err(e) => {
                let data = serde_json::json!({ "error": format!("failed to open log: {}", e) });
                yield Ok(Event::default().event("error").data(data.to_string()));
                return;
            }
        };

        let mut reader = BufReader::new(file);
        if reader.seek(std::io::SeekFrom::End(0)).await.is_err() {
            return;
        }

        let mut last_size = tokio::fs::metadata(&log_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut poll = tokio::time::interval(std::time::Duration::from_millis(500));
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let current_size = match tokio::fs::metadata(&log_path).await {
                        Ok(metadata) => metadata.len(),
                        Err(_) => continue,
                    };

                    if current_size < last_size {
                        // Truncated (e.g. rotated); start over from the top.
                        match tokio::fs::File::open(&log_path).await {
                            Ok(file) => {
                                reader = BufReader::new(file);
                                last_size = 0;
                            }
                            Err(_) => continue,
                        }
                    }

                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) => break,
                            Ok(_) => {
                                let data = serde_json::json!({ "line": line.clone() });
                                yield Ok(Event::default().event("log").data(data.to_string()));
                            }
                            Err(_) => break,
                        }
                    }

                    last_size = current_size;
                }
                _ = heartbeat.tick() => {
                    let data = serde_json::json!({ "timestamp": chrono::Utc::now().timestamp() });
                    yield Ok(Event::default().event("heartbeat").data(data.to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn vm_log_path(state: &AppState, id: Uuid) -> PathBuf {
    PathBuf::from(&state.orchestrator().config().hypervisor.logs_dir)
        .join(format!("{}.log", id))
}
