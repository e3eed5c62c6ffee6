//! Local capability probes
//!
//! Answers the server's `validate_capabilities` requests by checking each
//! descriptor from this machine.

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::messages::{CapabilityDescriptor, DelegateConnectionResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Context a probe needs about the delegate running it
#[derive(Debug, Clone)]
pub struct Prober {
    delegate_id: String,
    group_name: Option<String>,
    http: reqwest::Client,
}

impl Prober {
    pub fn new(delegate_id: impl Into<String>, group_name: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            delegate_id: delegate_id.into(),
            group_name,
            http,
        })
    }

    /// Probe every descriptor concurrently
    pub async fn probe_all(&self, capabilities: &[CapabilityDescriptor]) -> Vec<DelegateConnectionResult> {
        futures::future::join_all(capabilities.iter().map(|c| self.probe(c))).await
    }

    pub async fn probe(&self, capability: &CapabilityDescriptor) -> DelegateConnectionResult {
        let started = Instant::now();
        let validated = match capability {
            CapabilityDescriptor::HttpConnection { url } => self.http.head(url).send().await.is_ok(),
            CapabilityDescriptor::SocketConnection { host, port } => {
                matches!(
                    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), *port))).await,
                    Ok(Ok(_))
                )
            }
            CapabilityDescriptor::ProcessExecutor { executable } => find_executable(executable),
            CapabilityDescriptor::SystemEnv { variable, expected } => {
                std::env::var(variable).map_or(false, |v| &v == expected)
            }
            CapabilityDescriptor::DelegateGroup { group } => self.group_name.as_deref() == Some(group.as_str()),
        };

        tracing::debug!(
            capability = ?capability,
            validated = validated,
            "Probed capability"
        );
        DelegateConnectionResult {
            delegate_id: self.delegate_id.clone(),
            capability: capability.clone(),
            validated,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// An absolute path that exists, or a bare name found on PATH
fn find_executable(executable: &str) -> bool {
    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH").map_or(false, |paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(executable).is_file())
    })
}
