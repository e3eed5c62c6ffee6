//! Dispatch CLI - delegate agent and producer client

mod api;
mod client;
mod messages;
mod probe;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;
use uuid::Uuid;

use crate::api::ApiClient;
use crate::client::{Backoff, DelegateConnection};
use crate::messages::{
    CapabilityDescriptor, ConnectionMode, CreateTaskRequest, ServerMessage, TaskEvent,
    TaskPackage, TaskResponse,
};
use crate::probe::Prober;

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(about = "Run a delegate or submit and inspect tasks")]
#[command(version)]
struct Cli {
    /// Server base URL
    #[arg(short, long, env = "DISPATCH_SERVER", default_value = "http://localhost:3000")]
    server: Url,

    /// Account the delegate or tasks belong to
    #[arg(short, long, env = "DISPATCH_ACCOUNT", default_value = "default")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a delegate: claim tasks, run them, report results
    Agent {
        #[arg(short, long = "delegate", env = "DISPATCH_DELEGATE_ID")]
        delegate_id: String,

        #[arg(short, long)]
        group: Option<String>,

        /// Selector this delegate offers (repeatable)
        #[arg(long = "selector")]
        selectors: Vec<String>,

        /// Poll for task events instead of receiving pushes
        #[arg(long)]
        polling: bool,

        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,

        #[arg(long, default_value_t = 5)]
        poll_secs: u64,

        /// Exit after one task has been reported
        #[arg(long)]
        once: bool,
    },

    /// Queue a task
    Submit {
        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Required selector (repeatable)
        #[arg(long = "selector")]
        selectors: Vec<String>,

        /// Required capability as JSON (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        #[arg(long)]
        expiry_secs: Option<u64>,

        /// Block until the task ends and print its result
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a task
    Status {
        #[arg(short, long)]
        task: Uuid,
    },

    /// Show the selection log of a task
    Logs {
        #[arg(short, long)]
        task: Uuid,
    },

    /// Abort a task
    Abort {
        #[arg(short, long)]
        task: Uuid,
    },

    /// List delegates of the account
    Delegates,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatch_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Agent {
            delegate_id,
            group,
            selectors,
            polling,
            heartbeat_secs,
            poll_secs,
            once,
        } => {
            let options = AgentOptions {
                account_id: cli.account,
                delegate_id,
                group,
                selectors: selectors.into_iter().collect(),
                mode: if polling {
                    ConnectionMode::Polling
                } else {
                    ConnectionMode::Streaming
                },
                heartbeat: Duration::from_secs(heartbeat_secs),
                poll: Duration::from_secs(poll_secs),
                once,
            };
            run_agent(&cli.server, options).await
        }
        Commands::Submit {
            payload,
            description,
            selectors,
            capabilities,
            expiry_secs,
            wait,
        } => {
            let req = CreateTaskRequest {
                description,
                payload: serde_json::from_str(&payload)?,
                capabilities: capabilities
                    .iter()
                    .map(|c| serde_json::from_str::<CapabilityDescriptor>(c))
                    .collect::<Result<_, _>>()?,
                selectors: selectors.into_iter().collect(),
                expiry_secs,
            };
            run_submit(&ApiClient::new(&cli.server, &cli.account)?, &req, wait).await
        }
        Commands::Status { task } => {
            let api = ApiClient::new(&cli.server, &cli.account)?;
            let task = api.get_task(task).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            if task.status.is_terminal() {
                if let Some(message) = &task.error_message {
                    eprintln!("{}", message);
                }
            }
            Ok(())
        }
        Commands::Logs { task } => run_logs(&ApiClient::new(&cli.server, &cli.account)?, task).await,
        Commands::Abort { task } => {
            let api = ApiClient::new(&cli.server, &cli.account)?;
            let task = api.abort_task(task).await?;
            println!("Task {} is {:?}", task.id, task.status);
            Ok(())
        }
        Commands::Delegates => {
            let api = ApiClient::new(&cli.server, &cli.account)?;
            let delegates = api.list_delegates().await?;
            if delegates.is_empty() {
                println!("No delegates registered.");
            }
            for d in delegates {
                println!(
                    "  {} {:?} {:?} connected={} last heartbeat {}",
                    d.id,
                    d.approval,
                    d.connection_mode,
                    d.connected,
                    d.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
    }
}

async fn run_submit(api: &ApiClient, req: &CreateTaskRequest, wait: bool) -> Result<()> {
    if wait {
        return match api.execute_task(req).await {
            Ok(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                eprintln!("The task did not finish in time; it keeps running on the server.");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        };
    }
    let task = api.create_task(req).await?;
    println!("Queued task {}", task.id);
    if task.eligible_delegate_ids.is_empty() {
        println!("No delegate is eligible yet; the task waits until one appears or it expires.");
    } else {
        println!("Eligible: {}", task.eligible_delegate_ids.join(", "));
    }
    Ok(())
}

async fn run_logs(api: &ApiClient, task_id: Uuid) -> Result<()> {
    let entries = api.selection_logs(task_id).await?;
    println!("Selection log for {}:", task_id);
    println!("{:─<72}", "");
    for e in entries {
        println!(
            "{:>4} {} {:<24} {:<12} {} {}",
            e.seq.map(|s| s.to_string()).unwrap_or_default(),
            e.recorded_at.format("%H:%M:%S%.3f"),
            e.kind,
            e.conclusion,
            e.delegate_id.as_deref().unwrap_or("-"),
            e.reason
        );
    }
    Ok(())
}

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

struct AgentOptions {
    account_id: String,
    delegate_id: String,
    group: Option<String>,
    selectors: BTreeSet<String>,
    mode: ConnectionMode,
    heartbeat: Duration,
    poll: Duration,
    once: bool,
}

/// Output of a task runner, relayed through the agent loop
enum RunnerUpdate {
    Progress(Uuid, serde_json::Value),
    Done(Uuid, TaskResponse),
}

/// How one connected session ended
enum SessionEnd {
    /// Done for good: `--once` finished or the user interrupted
    Finished,
    /// The socket went away; the server has handed our tasks to others
    Lost(String),
}

async fn run_agent(server: &Url, opts: AgentOptions) -> Result<()> {
    let url = client::websocket_url(server)?;
    let prober = Prober::new(&opts.delegate_id, opts.group.clone())?;
    let mut backoff = Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX);

    loop {
        match DelegateConnection::connect(&url).await {
            Ok(conn) => match run_session(conn, &opts, &prober, &mut backoff).await? {
                SessionEnd::Finished => return Ok(()),
                SessionEnd::Lost(reason) => {
                    tracing::warn!(reason = %reason, "Lost connection to the server");
                }
            },
            Err(e) => tracing::warn!(error = %e, "Failed to connect"),
        }

        let delay = backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                return Ok(());
            }
        }
    }
}

/// Register on a fresh connection and serve until it ends
async fn run_session(
    mut conn: DelegateConnection,
    opts: &AgentOptions,
    prober: &Prober,
    backoff: &mut Backoff,
) -> Result<SessionEnd> {
    // A refusal from the server is fatal, retrying would not help
    let registered = conn
        .register(
            &opts.account_id,
            &opts.delegate_id,
            opts.group.clone(),
            opts.selectors.clone(),
            opts.mode,
        )
        .await?;
    let Some(delegate) = registered else {
        return Ok(SessionEnd::Lost(conn.closed().await.to_string()));
    };
    backoff.reset();
    println!(
        "Delegate {} registered ({:?}, {:?})",
        delegate.id, delegate.approval, delegate.connection_mode
    );

    let mut running: HashMap<Uuid, JoinHandle<()>> = HashMap::new();
    let end = serve(&mut conn, opts, prober, &mut running).await;

    // Whatever still runs here was failed over when the socket closed; its
    // result would be refused.
    for (task_id, runner) in running.drain() {
        tracing::info!(task_id = %task_id, "Stopping task of the ended session");
        runner.abort();
    }

    // Closing a socket that is already gone just reports why it went
    let reason = conn.close().await;
    match end {
        Ok(SessionEnd::Finished) => {
            tracing::debug!(reason = %reason, "Connection closed");
            Ok(SessionEnd::Finished)
        }
        Ok(SessionEnd::Lost(_)) | Err(_) => Ok(SessionEnd::Lost(reason.to_string())),
    }
}

/// Pump messages, runner updates and timers. Send failures mean the
/// connection is gone and surface as errors.
async fn serve(
    conn: &mut DelegateConnection,
    opts: &AgentOptions,
    prober: &Prober,
    running: &mut HashMap<Uuid, JoinHandle<()>>,
) -> Result<SessionEnd> {
    let (updates_tx, mut updates_rx) = mpsc::channel::<RunnerUpdate>(32);
    let mut heartbeat = tokio::time::interval(opts.heartbeat);
    let mut poll = tokio::time::interval(opts.poll);
    let polling = opts.mode == ConnectionMode::Polling;

    loop {
        tokio::select! {
            msg = conn.recv() => {
                let Some(msg) = msg else {
                    return Ok(SessionEnd::Lost("Connection closed".to_string()));
                };
                match msg {
                    ServerMessage::TaskOffered { task_id } => {
                        if !running.contains_key(&task_id) {
                            conn.acquire(task_id).await?;
                        }
                    }
                    ServerMessage::TaskEvents { events } => {
                        for event in events {
                            match event {
                                TaskEvent::Queued { task_id } if !running.contains_key(&task_id) => {
                                    conn.acquire(task_id).await?;
                                }
                                TaskEvent::Aborted { task_id } => stop_runner(running, task_id),
                                _ => {}
                            }
                        }
                    }
                    ServerMessage::ValidateCapabilities { task_id, capabilities } => {
                        let results = prober.probe_all(&capabilities).await;
                        conn.report_connection_results(task_id, results).await?;
                    }
                    ServerMessage::ValidationRequired { task_id, capabilities } => {
                        let results = prober.probe_all(&capabilities).await;
                        conn.report_connection_results(Some(task_id), results).await?;
                        conn.acquire(task_id).await?;
                    }
                    ServerMessage::TaskAcquired { package } => {
                        println!("Acquired task {}", package.task_id);
                        let task_id = package.task_id;
                        running.insert(task_id, spawn_runner(package, updates_tx.clone()));
                    }
                    ServerMessage::TaskAborted { task_id } => stop_runner(running, task_id),
                    ServerMessage::NoTask { task_id } => {
                        tracing::debug!(task_id = %task_id, "Task went to another delegate");
                    }
                    ServerMessage::ResultAccepted { task_id, status } => {
                        println!("Task {} ended as {:?}", task_id, status);
                        if opts.once {
                            return Ok(SessionEnd::Finished);
                        }
                    }
                    ServerMessage::HeartbeatAck { approval, .. } => {
                        tracing::debug!(approval = ?approval, "Heartbeat acknowledged");
                    }
                    ServerMessage::Registered { .. } | ServerMessage::Ack => {}
                    ServerMessage::Error { message } => {
                        tracing::warn!("Server error: {}", message);
                    }
                }
            }
            Some(update) = updates_rx.recv() => {
                match update {
                    RunnerUpdate::Progress(task_id, progress) => conn.progress(task_id, progress).await?,
                    RunnerUpdate::Done(task_id, response) => {
                        running.remove(&task_id);
                        conn.report_result(task_id, response).await?;
                    }
                }
            }
            _ = heartbeat.tick() => {
                conn.heartbeat(&opts.account_id, &opts.delegate_id, opts.mode).await?;
            }
            _ = poll.tick(), if polling => {
                conn.poll().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                return Ok(SessionEnd::Finished);
            }
        }
    }
}

fn stop_runner(running: &mut HashMap<Uuid, JoinHandle<()>>, task_id: Uuid) {
    if let Some(runner) = running.remove(&task_id) {
        println!("Task {} aborted", task_id);
        runner.abort();
    }
}

/// Run a task package. A payload with `command` (and optional `args`) is
/// executed; anything else is echoed back as the result.
fn spawn_runner(package: TaskPackage, updates: mpsc::Sender<RunnerUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = package.task_id;
        let _ = updates
            .send(RunnerUpdate::Progress(task_id, serde_json::json!({"state": "running"})))
            .await;
        let response = execute(&package.payload).await;
        let _ = updates.send(RunnerUpdate::Done(task_id, response)).await;
    })
}

async fn execute(payload: &serde_json::Value) -> TaskResponse {
    let Some(command) = payload.get("command").and_then(|c| c.as_str()) else {
        return TaskResponse::Success {
            result: serde_json::json!({ "echo": payload }),
        };
    };
    let args: Vec<String> = payload
        .get("args")
        .and_then(|a| a.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let output = tokio::process::Command::new(command)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => TaskResponse::Success {
            result: serde_json::json!({
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
        },
        Ok(output) => TaskResponse::Failure {
            message: format!(
                "{} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        },
        Err(e) => TaskResponse::Failure {
            message: format!("Failed to start {}: {}", command, e),
        },
    }
}
