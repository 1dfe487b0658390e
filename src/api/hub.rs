//! The `/conversionHub` realtime channel.
//!
//! Each WebSocket connection tracks the set of topics it has joined and
//! filters the process-wide push bus against it. Client frames are JSON
//! invocations (`JoinTaskGroup`, `CancelTask`, ...); server frames are the
//! tagged events from [`crate::push::Event`]. Delivery is at-least-once
//! while connected and FIFO per connection; nothing is replayed after a
//! reconnect, so clients re-query status when they come back.

use super::AppState;
use crate::push;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use vidforge_api::models::TaskSnapshot;

/// Invocations a client may send over the hub
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum HubInvocation {
    JoinTaskGroup { task_id: String },
    LeaveTaskGroup { task_id: String },
    JoinSpaceMonitoring,
    JoinBatchTaskGroup { batch_id: String },
    GetTaskStatus { task_id: String },
    CancelTask { task_id: String },
}

/// Frames the hub sends beyond bus events
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
enum HubReply {
    TaskStatus(TaskSnapshot),
    HubError { message: String },
}

/// Upgrade handler for `/conversionHub`
pub async fn hub_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: AppState) {
    info!(target: "api::hub", "Hub connection established");

    let mut bus = state.push.subscribe();
    // Every connection hears system-wide notifications
    let mut topics: HashSet<String> = HashSet::from([push::SYSTEM_TOPIC.to_string()]);

    loop {
        tokio::select! {
            envelope = bus.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if !topics.contains(&envelope.topic) {
                            continue;
                        }
                        match serde_json::to_string(&envelope.event) {
                            Ok(json) => {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(target: "api::hub", error = %err, "Failed to serialize event");
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The subscriber fell behind; per the channel contract
                        // it must re-query state rather than expect replay
                        warn!(
                            target: "api::hub",
                            skipped,
                            "Hub subscriber lagged, events dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_invocation(&state, &mut topics, &text).await {
                            let json = match serde_json::to_string(&reply) {
                                Ok(json) => json,
                                Err(_) => continue,
                            };
                            if socket.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(target: "api::hub", error = %err, "Hub socket error");
                        break;
                    }
                }
            }
        }
    }

    info!(target: "api::hub", "Hub connection closed");
}

/// Apply one client invocation, returning an optional direct reply
async fn handle_invocation(
    state: &AppState,
    topics: &mut HashSet<String>,
    raw: &str,
) -> Option<HubReply> {
    let invocation: HubInvocation = match serde_json::from_str(raw) {
        Ok(invocation) => invocation,
        Err(err) => {
            return Some(HubReply::HubError {
                message: format!("Malformed invocation: {err}"),
            });
        }
    };

    match invocation {
        HubInvocation::JoinTaskGroup { task_id } => {
            // A subscriber may hold a client token, file name, or path
            // instead of the server id; resolve before joining so progress
            // is not lost in the propagation window
            let resolved = match state.engine.resolve_task_ref(&task_id) {
                Ok(Some(task)) => task.id,
                _ => task_id,
            };
            debug!(target: "api::hub", task_id = %resolved, "Joined task group");
            topics.insert(push::task_topic(&resolved));
            None
        }
        HubInvocation::LeaveTaskGroup { task_id } => {
            let resolved = match state.engine.resolve_task_ref(&task_id) {
                Ok(Some(task)) => task.id,
                _ => task_id,
            };
            topics.remove(&push::task_topic(&resolved));
            None
        }
        HubInvocation::JoinSpaceMonitoring => {
            topics.insert(push::SPACE_TOPIC.to_string());
            // Joining space monitoring gets an immediate snapshot
            let snapshot = state.budget.status().await;
            state.push.disk_space_update(snapshot);
            None
        }
        HubInvocation::JoinBatchTaskGroup { batch_id } => {
            topics.insert(push::batch_topic(&batch_id));
            None
        }
        HubInvocation::GetTaskStatus { task_id } => match state.engine.resolve_task_ref(&task_id) {
            Ok(Some(task)) => Some(HubReply::TaskStatus(task.to_snapshot())),
            Ok(None) => Some(HubReply::HubError {
                message: format!("Task not found: {task_id}"),
            }),
            Err(err) => Some(HubReply::HubError {
                message: format!("Lookup failed: {err}"),
            }),
        },
        HubInvocation::CancelTask { task_id } => {
            let resolved = match state.engine.resolve_task_ref(&task_id) {
                Ok(Some(task)) => task.id,
                _ => task_id,
            };
            // The resulting StatusUpdate is observed through the channel
            match state.engine.cancel(&resolved).await {
                Ok(()) => None,
                Err(err) => Some(HubReply::HubError {
                    message: err.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::Event;

    #[test]
    fn invocations_deserialize_from_tagged_frames() {
        let invocation: HubInvocation =
            serde_json::from_str(r#"{"method":"joinTaskGroup","taskId":"t-1"}"#).unwrap();
        assert!(matches!(
            invocation,
            HubInvocation::JoinTaskGroup { task_id } if task_id == "t-1"
        ));

        let invocation: HubInvocation =
            serde_json::from_str(r#"{"method":"joinSpaceMonitoring"}"#).unwrap();
        assert!(matches!(invocation, HubInvocation::JoinSpaceMonitoring));

        assert!(serde_json::from_str::<HubInvocation>(r#"{"method":"selfDestruct"}"#).is_err());
    }

    #[test]
    fn replies_serialize_with_type_tags() {
        let reply = HubReply::HubError {
            message: "nope".to_string(),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "hubError");
        assert_eq!(value["data"]["message"], "nope");
    }

    #[test]
    fn event_frames_match_the_push_schema() {
        let event = Event::StatusUpdate {
            task_id: "t-1".to_string(),
            status: vidforge_api::models::TaskStatus::Cancelled,
            error_message: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "statusUpdate");
        assert_eq!(value["data"]["status"], "cancelled");
    }
}
