//! WebSocket connection for a delegate agent
//!
//! For a streaming delegate the socket is the liveness signal: once it
//! closes, the server marks the delegate disconnected and hands whatever it
//! was running to someone else. A lost connection therefore ends the session
//! and the agent has to register again on a fresh socket.

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::messages::{
    ClientMessage, ConnectionMode, Delegate, DelegateConnectionResult, ServerMessage, TaskResponse,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map an `http(s)://` server URL to its `ws(s)://.../ws` endpoint
pub fn websocket_url(server: &Url) -> Result<Url> {
    let mut url = server.join("ws")?;
    let scheme = match server.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot use {} as a WebSocket URL", server))?;
    Ok(url)
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// We sent the close frame
    Requested,
    /// The server sent a close frame
    ClosedByServer(Option<String>),
    /// The socket failed or ended without a close frame
    Dropped(String),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Requested => write!(f, "closed by the agent"),
            Disconnect::ClosedByServer(Some(reason)) => write!(f, "closed by the server: {}", reason),
            Disconnect::ClosedByServer(None) => write!(f, "closed by the server"),
            Disconnect::Dropped(reason) => write!(f, "connection dropped: {}", reason),
        }
    }
}

/// Exponential reconnect delay, reset once a session got registered
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Bound delegate connection
pub struct DelegateConnection {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<ServerMessage>,
    handle: JoinHandle<Disconnect>,
}

impl DelegateConnection {
    pub async fn connect(url: &Url) -> Result<Self> {
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(32);

        let handle = tokio::spawn(async move {
            let mut closing = false;
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv(), if !closing => {
                        closing = matches!(msg, Message::Close(_));
                        if let Err(e) = write.send(msg).await {
                            break Disconnect::Dropped(e.to_string());
                        }
                    }
                    result = read.next() => {
                        match result {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => {
                                        // nobody listening any more
                                        if in_tx.send(msg).await.is_err() && !closing {
                                            break Disconnect::Requested;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse message: {} - {}", e, text);
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    break Disconnect::Dropped(e.to_string());
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                if closing {
                                    break Disconnect::Requested;
                                }
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .filter(|r| !r.is_empty());
                                break Disconnect::ClosedByServer(reason);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) if closing => break Disconnect::Requested,
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error: {}", e);
                                break Disconnect::Dropped(e.to_string());
                            }
                            None if closing => break Disconnect::Requested,
                            None => break Disconnect::Dropped("stream ended".to_string()),
                        }
                    }
                }
            }
        });

        tracing::info!("Connected successfully");

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            handle,
        })
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let json = serde_json::to_string(&msg)?;
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| anyhow!("Connection is closed"))
    }

    /// Next message from the server; `None` once the socket is gone
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Why the socket went away. Call after `recv` returned `None`.
    pub async fn closed(self) -> Disconnect {
        match self.handle.await {
            Ok(reason) => reason,
            Err(e) => Disconnect::Dropped(e.to_string()),
        }
    }

    /// Send a close frame and wait briefly for the server to answer it.
    /// The server then marks this delegate disconnected.
    pub async fn close(self) -> Disconnect {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "delegate shutting down".into(),
        };
        if self.tx.send(Message::Close(Some(frame))).await.is_err() {
            return self.closed().await;
        }
        let DelegateConnection { tx, rx, mut handle } = self;
        drop(tx);
        drop(rx);
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => Disconnect::Dropped(e.to_string()),
            Err(_) => {
                handle.abort();
                Disconnect::Requested
            }
        }
    }

    /// Register and wait for the server to confirm. `None` if the
    /// connection closed first; an error is the server refusing.
    pub async fn register(
        &mut self,
        account_id: &str,
        delegate_id: &str,
        group_name: Option<String>,
        selectors: BTreeSet<String>,
        connection_mode: ConnectionMode,
    ) -> Result<Option<Delegate>> {
        let sent = self
            .send(ClientMessage::Register {
                delegate_id: delegate_id.to_string(),
                account_id: account_id.to_string(),
                group_name,
                selectors,
                connection_mode,
            })
            .await;
        if sent.is_err() {
            return Ok(None);
        }

        while let Some(msg) = self.recv().await {
            match msg {
                ServerMessage::Registered { delegate } => return Ok(Some(delegate)),
                ServerMessage::Error { message } => {
                    return Err(anyhow!("Server error: {}", message));
                }
                _ => continue,
            }
        }

        Ok(None)
    }

    pub async fn heartbeat(&self, account_id: &str, delegate_id: &str, connection_mode: ConnectionMode) -> Result<()> {
        self.send(ClientMessage::Heartbeat {
            account_id: account_id.to_string(),
            delegate_id: delegate_id.to_string(),
            connection_mode,
        })
        .await
    }

    pub async fn poll(&self) -> Result<()> {
        self.send(ClientMessage::Poll).await
    }

    pub async fn acquire(&self, task_id: Uuid) -> Result<()> {
        self.send(ClientMessage::Acquire { task_id }).await
    }

    pub async fn report_connection_results(
        &self,
        task_id: Option<Uuid>,
        results: Vec<DelegateConnectionResult>,
    ) -> Result<()> {
        self.send(ClientMessage::ReportConnectionResults { task_id, results })
            .await
    }

    pub async fn progress(&self, task_id: Uuid, progress: serde_json::Value) -> Result<()> {
        self.send(ClientMessage::Progress { task_id, progress }).await
    }

    pub async fn report_result(&self, task_id: Uuid, response: TaskResponse) -> Result<()> {
        self.send(ClientMessage::ReportResult { task_id, response })
            .await
    }
}
