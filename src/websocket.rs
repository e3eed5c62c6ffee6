//! Delegate WebSocket channel
//!
//! A delegate binds its connection with `register` or `heartbeat`, then polls,
//! acquires and reports over the same socket. Once bound, the connection also
//! receives task offers, abort notices and capability probes addressed to it.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatch::{
    AcquireOutcome, ApprovalState, CapabilityDescriptor, ConnectionMode, Delegate,
    DelegateConnectionResult, DelegateRegistration, DispatchEvent, Dispatcher, TaskEvent,
    TaskPackage, TaskResponse, TaskStatus,
};
use crate::error::{DispatchError, Result};
use crate::AppState;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Who is on the other end of a bound connection
#[derive(Debug, Clone)]
struct Identity {
    account_id: String,
    delegate_id: String,
    mode: ConnectionMode,
}

#[derive(Default)]
struct Session {
    identity: Option<Identity>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    fn identity(&self) -> Result<&Identity> {
        self.identity.as_ref().ok_or_else(|| {
            DispatchError::InvalidStateTransition(
                "Send register or heartbeat before other messages".to_string(),
            )
        })
    }

    fn bind(
        &mut self,
        identity: Identity,
        dispatcher: &Arc<Dispatcher>,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        if let Some(current) = &self.identity {
            if current.delegate_id == identity.delegate_id && current.mode == identity.mode {
                return;
            }
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.forwarder = Some(spawn_forwarder(
            dispatcher.clone(),
            identity.delegate_id.clone(),
            out.clone(),
        ));
        self.identity = Some(identity);
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                tracing::debug!("WebSocket send failed: {}", e);
                break;
            }
        }
    });

    let mut session = Session::default();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                let _ = out_tx.send(ServerMessage::Error {
                    message: format!("Invalid message: {}", e),
                });
                continue;
            }
        };

        let reply = match handle_message(&state.dispatcher, &mut session, &out_tx, client_msg).await {
            Ok(reply) => reply,
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        };
        if out_tx.send(reply).is_err() {
            break;
        }
    }

    if let Some(forwarder) = session.forwarder.take() {
        forwarder.abort();
    }
    if let Some(identity) = session.identity.take() {
        if identity.mode == ConnectionMode::Streaming {
            match state
                .dispatcher
                .mark_disconnected(&identity.account_id, &identity.delegate_id)
                .await
            {
                Ok(failed_over) => tracing::info!(
                    delegate_id = %identity.delegate_id,
                    failed_over = failed_over,
                    "Streaming delegate disconnected"
                ),
                Err(e) => tracing::warn!(delegate_id = %identity.delegate_id, error = %e, "Failed to mark delegate disconnected"),
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

async fn handle_message(
    dispatcher: &Arc<Dispatcher>,
    session: &mut Session,
    out: &mpsc::UnboundedSender<ServerMessage>,
    msg: ClientMessage,
) -> Result<ServerMessage> {
    match msg {
        ClientMessage::Register(registration) => {
            let delegate = dispatcher.register_delegate(registration).await;
            session.bind(
                Identity {
                    account_id: delegate.account_id.clone(),
                    delegate_id: delegate.id.clone(),
                    mode: delegate.connection_mode,
                },
                dispatcher,
                out,
            );
            Ok(ServerMessage::Registered { delegate })
        }
        ClientMessage::Heartbeat {
            account_id,
            delegate_id,
            timestamp,
            connection_mode,
        } => {
            let mode = connection_mode.unwrap_or(ConnectionMode::Streaming);
            let delegate = dispatcher
                .register_heartbeat(&account_id, &delegate_id, timestamp.unwrap_or_else(Utc::now), mode)
                .await?;
            session.bind(
                Identity {
                    account_id: delegate.account_id.clone(),
                    delegate_id: delegate.id.clone(),
                    mode,
                },
                dispatcher,
                out,
            );
            Ok(ServerMessage::HeartbeatAck {
                delegate_id: delegate.id,
                approval: delegate.approval,
            })
        }
        ClientMessage::Poll => {
            let id = session.identity()?;
            let events = dispatcher
                .poll_task_events(&id.account_id, &id.delegate_id)
                .await?;
            Ok(ServerMessage::TaskEvents { events })
        }
        ClientMessage::Acquire { task_id } => {
            let id = session.identity()?;
            let outcome = dispatcher
                .acquire_task(&id.account_id, &id.delegate_id, task_id)
                .await?;
            Ok(match outcome {
                AcquireOutcome::Acquired(package) => ServerMessage::TaskAcquired { package },
                AcquireOutcome::ValidationRequired {
                    task_id,
                    capabilities,
                } => ServerMessage::ValidationRequired {
                    task_id,
                    capabilities,
                },
                AcquireOutcome::NotAvailable => ServerMessage::NoTask { task_id },
            })
        }
        ClientMessage::ReportConnectionResults { task_id, results } => {
            let id = session.identity()?;
            match task_id {
                Some(task_id) => {
                    dispatcher
                        .report_connection_results(&id.account_id, &id.delegate_id, task_id, results)
                        .await?
                }
                None => {
                    dispatcher
                        .record_probe_results(&id.delegate_id, results)
                        .await;
                }
            }
            Ok(ServerMessage::Ack)
        }
        ClientMessage::Progress { task_id, progress } => {
            let id = session.identity()?;
            dispatcher
                .publish_task_progress_response(&id.account_id, &id.delegate_id, task_id, progress)
                .await?;
            Ok(ServerMessage::Ack)
        }
        ClientMessage::ReportResult { task_id, response } => {
            let id = session.identity()?;
            let task = dispatcher
                .report_task_response(&id.account_id, &id.delegate_id, task_id, response)
                .await?;
            Ok(ServerMessage::ResultAccepted {
                task_id,
                status: task.status,
            })
        }
    }
}

/// Push dispatcher events and probe requests addressed to `delegate_id`
fn spawn_forwarder(
    dispatcher: Arc<Dispatcher>,
    delegate_id: String,
    out: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::StreamExt as TokioStreamExt;

    let target = delegate_id.clone();
    let events = TokioStreamExt::filter_map(BroadcastStream::new(dispatcher.subscribe()), move |event| match event {
        Ok(event) => push_for(&target, event),
        Err(e) => {
            tracing::warn!(delegate_id = %target, "Event forwarder lagged: {}", e);
            None
        }
    });
    let target = delegate_id;
    let probes = TokioStreamExt::filter_map(BroadcastStream::new(dispatcher.subscribe_probes()), move |probe| match probe {
        Ok(probe) if probe.delegate_id == target => Some(ServerMessage::ValidateCapabilities {
            task_id: probe.task_id,
            capabilities: probe.capabilities,
        }),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(delegate_id = %target, "Probe forwarder lagged: {}", e);
            None
        }
    });

    let mut merged = Box::pin(TokioStreamExt::merge(events, probes));
    tokio::spawn(async move {
        while let Some(msg) = TokioStreamExt::next(&mut merged).await {
            if out.send(msg).is_err() {
                break;
            }
        }
    })
}

fn push_for(delegate_id: &str, event: DispatchEvent) -> Option<ServerMessage> {
    match event {
        DispatchEvent::TaskOffered {
            task_id,
            delegate_id: offered_to,
            ..
        } if offered_to == delegate_id => Some(ServerMessage::TaskOffered { task_id }),
        DispatchEvent::TaskAborted {
            task_id,
            delegate_id: Some(owner),
            ..
        } if owner == delegate_id => Some(ServerMessage::TaskAborted { task_id }),
        _ => None,
    }
}

/// Messages from delegate to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Full registration; binds the connection
    Register(DelegateRegistration),
    /// Liveness signal; binds the connection, creating the delegate if unknown
    Heartbeat {
        account_id: String,
        delegate_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        connection_mode: Option<ConnectionMode>,
    },
    /// List claimable tasks and pending abort notices
    Poll,
    Acquire { task_id: Uuid },
    /// Answer to a probe; `task_id` is absent for probes not tied to a task
    ReportConnectionResults {
        #[serde(default)]
        task_id: Option<Uuid>,
        results: Vec<DelegateConnectionResult>,
    },
    Progress {
        task_id: Uuid,
        progress: serde_json::Value,
    },
    ReportResult {
        task_id: Uuid,
        response: TaskResponse,
    },
}

/// Messages from server to delegate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { delegate: Delegate },
    HeartbeatAck {
        delegate_id: String,
        approval: ApprovalState,
    },
    TaskEvents { events: Vec<TaskEvent> },
    /// Pushed: the delegate is next in line for a task
    TaskOffered { task_id: Uuid },
    /// Pushed: probe these and answer with `report_connection_results`
    ValidateCapabilities {
        task_id: Option<Uuid>,
        capabilities: Vec<CapabilityDescriptor>,
    },
    TaskAcquired { package: TaskPackage },
    ValidationRequired {
        task_id: Uuid,
        capabilities: Vec<CapabilityDescriptor>,
    },
    NoTask { task_id: Uuid },
    /// Pushed: stop working on a task
    TaskAborted { task_id: Uuid },
    ResultAccepted { task_id: Uuid, status: TaskStatus },
    Ack,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "heartbeat", "account_id": "acct", "delegate_id": "d-1"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Heartbeat {
                timestamp: None,
                connection_mode: None,
                ..
            }
        ));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "register", "delegate_id": "d-1", "account_id": "acct",
                "selectors": ["gpu"], "connection_mode": "streaming"}"#,
        )
        .unwrap();
        let ClientMessage::Register(registration) = msg else {
            panic!("expected register");
        };
        assert!(registration.selectors.contains("gpu"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "report_result", "task_id": "00000000-0000-0000-0000-000000000000",
                "response": {"outcome": "failure", "message": "boom"}}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::ReportResult {
                response: TaskResponse::Failure { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_server_message_wire_format() {
        let json = serde_json::to_value(ServerMessage::NoTask {
            task_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "no_task");

        let json = serde_json::to_value(ServerMessage::Ack).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ack"}));
    }

    #[test]
    fn test_push_for_filters_by_delegate() {
        let task_id = Uuid::new_v4();
        let offered = DispatchEvent::TaskOffered {
            account_id: "acct".to_string(),
            task_id,
            delegate_id: "d-1".to_string(),
        };
        assert!(push_for("d-2", offered.clone()).is_none());
        assert!(matches!(
            push_for("d-1", offered),
            Some(ServerMessage::TaskOffered { .. })
        ));

        let aborted = DispatchEvent::TaskAborted {
            account_id: "acct".to_string(),
            task_id,
            delegate_id: None,
        };
        assert!(push_for("d-1", aborted).is_none());
    }
}
