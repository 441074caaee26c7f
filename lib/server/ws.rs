//! WebSocket streaming: replay, live fan-out, input, and liveness pings.

use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::{WsCommand, WsEvent};

use super::state::AppState;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// An unanswered ping after this long closes the socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for the GET /api/v1/tasks/{id}/stream endpoint.
pub async fn ws_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, id, socket))
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn handle_socket(state: AppState, task_id: Uuid, mut socket: WebSocket) {
    // Unknown task: policy-violation close, nothing else.
    if state.orchestrator().store().get(task_id).await.is_err() {
        warn!(task_id = %task_id, "stream requested for unknown task");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "task not found".into(),
            })))
            .await;
        return;
    }

    let hub = state.orchestrator().hubs().get_or_create(task_id).await;
    let (replay, mut events) = hub.subscribe();

    let (mut sender, mut receiver) = socket.split();

    // Buffered history first, then the live stream; the hub guarantees the
    // seam has no duplicates and no gaps.
    for event in replay {
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }

    let mut ping = time::interval_at(time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut answered = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(task_id = %task_id, skipped, "dropping slow subscriber");
                    let _ = send_event(
                        &mut sender,
                        &WsEvent::Error { message: "slow consumer".to_string() },
                    )
                    .await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    answered = true;
                    handle_command(&state, task_id, &mut sender, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                    answered = true;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = ping.tick() => {
                if !answered {
                    debug!(task_id = %task_id, "closing idle websocket");
                    break;
                }
                answered = false;
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(events);
    state.orchestrator().hubs().release(task_id).await;
}

async fn handle_command(
    state: &AppState,
    task_id: Uuid,
    sender: &mut SplitSink<WebSocket, Message>,
    text: &str,
) {
    match serde_json::from_str::<WsCommand>(text) {
        Ok(WsCommand::Input { data }) => {
            if !state.orchestrator().send_input(task_id, data).await {
                warn!(task_id = %task_id, "input dropped, no live relay");
            }
        }
        Ok(WsCommand::Ping) => {
            let _ = send_event(sender, &WsEvent::Pong).await;
        }
        Err(e) => {
            debug!(task_id = %task_id, error = %e, "ignoring malformed client message");
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &WsEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
