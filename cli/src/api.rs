//! REST client for the producer and operator endpoints

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::messages::{
    CreateTaskRequest, Delegate, DelegateTask, ExecuteTaskResponse, SelectionLogEntry,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Server returned {status}: {message}")]
    Server {
        status: StatusCode,
        message: String,
        retryable: bool,
    },

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Server { retryable, .. } => *retryable,
            ApiError::Http(e) => e.is_timeout() || e.is_connect(),
            ApiError::Url(_) => false,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    retryable: bool,
}

/// Account-scoped client for `/api/v1/accounts/:account_id`
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(server: &Url, account_id: &str) -> Result<Self, ApiError> {
        let base = server.join(&format!("api/v1/accounts/{}/", account_id))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base.join(path)?;
        tracing::debug!("{} {}", method, url);

        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let (message, retryable) = match response.json::<ErrorBody>().await {
            Ok(body) => (body.error, body.retryable),
            Err(_) => (status.canonical_reason().unwrap_or("unknown").to_string(), false),
        };
        Err(ApiError::Server {
            status,
            message,
            retryable,
        })
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<DelegateTask, ApiError> {
        self.request(Method::POST, "tasks", Some(req)).await
    }

    /// Queue a task and block until it ends or the server's sync timeout passes
    pub async fn execute_task(&self, req: &CreateTaskRequest) -> Result<serde_json::Value, ApiError> {
        let response: ExecuteTaskResponse = self.request(Method::POST, "tasks/execute", Some(req)).await?;
        Ok(response.result)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<DelegateTask, ApiError> {
        self.request::<(), _>(Method::GET, &format!("tasks/{}", task_id), None)
            .await
    }

    pub async fn abort_task(&self, task_id: Uuid) -> Result<DelegateTask, ApiError> {
        self.request::<(), _>(Method::POST, &format!("tasks/{}/abort", task_id), None)
            .await
    }

    pub async fn selection_logs(&self, task_id: Uuid) -> Result<Vec<SelectionLogEntry>, ApiError> {
        self.request::<(), _>(Method::GET, &format!("tasks/{}/selection-logs", task_id), None)
            .await
    }

    pub async fn list_delegates(&self) -> Result<Vec<Delegate>, ApiError> {
        self.request::<(), _>(Method::GET, "delegates", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_account_scoped() {
        let server = Url::parse("http://localhost:3000").unwrap();
        let client = ApiClient::new(&server, "acct").unwrap();
        assert_eq!(
            client.base.join("tasks").unwrap().as_str(),
            "http://localhost:3000/api/v1/accounts/acct/tasks"
        );
    }

    #[test]
    fn test_server_error_retryability() {
        let err = ApiError::Server {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: "timed out".to_string(),
            retryable: true,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("504"));
    }
}
