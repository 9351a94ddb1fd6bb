//! Remote API client.
//!
//! The sync queue replays mutations through the [`RemoteApi`] trait; the
//! orchestrator refreshes the record cache through it. [`HttpApi`] is the
//! production implementation on top of `reqwest`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::Result;
use crate::mutation::PendingMutation;

/// Why a single remote call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// The request never got an answer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error(
        "rejected with status {status}: {}",
        .message.as_deref().unwrap_or("no error message")
    )]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// The `error` field of the response body, if present.
        message: Option<String>,
    },

    /// The response body could not be decoded.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ReplayError {
    /// HTTP status of a rejected request.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Remote endpoints used by the sync machinery.
#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    /// Send a queued mutation with its original verb and body.
    ///
    /// Returns the success status code.
    async fn replay(&self, mutation: &PendingMutation) -> std::result::Result<u16, ReplayError>;

    /// Fetch every record of a collection endpoint.
    async fn fetch_all(&self, url: &str) -> std::result::Result<Vec<Value>, ReplayError>;
}

/// HTTP implementation of [`RemoteApi`].
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client from the `[api]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    /// Create a client reusing an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// The base URL relative endpoints resolve against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve an endpoint against the base URL.
    ///
    /// Absolute URLs are returned unchanged.
    #[must_use]
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn rejection(response: reqwest::Response) -> ReplayError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error);
        ReplayError::Rejected { status, message }
    }
}

#[async_trait::async_trait]
impl RemoteApi for HttpApi {
    async fn replay(&self, mutation: &PendingMutation) -> std::result::Result<u16, ReplayError> {
        let url = self.resolve(&mutation.url);
        debug!("Replaying {} {}", mutation.method, url);

        let response = self
            .client
            .request(mutation.method.into(), &url)
            .json(&mutation.data)
            .send()
            .await
            .map_err(|e| ReplayError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(response.status().as_u16())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    async fn fetch_all(&self, url: &str) -> std::result::Result<Vec<Value>, ReplayError> {
        let url = self.resolve(url);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReplayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        match response
            .json::<Value>()
            .await
            .map_err(|e| ReplayError::Decode(e.to_string()))?
        {
            Value::Array(records) => Ok(records),
            other => Err(ReplayError::Decode(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Scripted [`RemoteApi`] for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Answers replays from a script of status codes, in call order.
    ///
    /// Status 0 stands for a transport failure. An exhausted script answers
    /// 201.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedApi {
        script: Mutex<VecDeque<u16>>,
        calls: Mutex<Vec<PendingMutation>>,
        records: Mutex<Vec<Value>>,
    }

    impl ScriptedApi {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_script(statuses: &[u16]) -> Self {
            let api = Self::new();
            api.script.lock().unwrap().extend(statuses.iter().copied());
            api
        }

        pub(crate) fn with_records(records: Vec<Value>) -> Self {
            let api = Self::new();
            *api.records.lock().unwrap() = records;
            api
        }

        pub(crate) fn calls(&self) -> Vec<PendingMutation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RemoteApi for ScriptedApi {
        async fn replay(
            &self,
            mutation: &PendingMutation,
        ) -> std::result::Result<u16, ReplayError> {
            self.calls.lock().unwrap().push(mutation.clone());
            let status = self.script.lock().unwrap().pop_front().unwrap_or(201);
            match status {
                0 => Err(ReplayError::Transport("connection refused".to_string())),
                200..=299 => Ok(status),
                _ => Err(ReplayError::Rejected {
                    status,
                    message: Some("scripted failure".to_string()),
                }),
            }
        }

        async fn fetch_all(&self, _url: &str) -> std::result::Result<Vec<Value>, ReplayError> {
            Ok(self.records.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::HttpMethod;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn test_client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Accept one connection, answer it, and return the raw request text.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);

                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let body_len = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}"), task)
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let api = HttpApi::with_client(test_client(), "http://relief.local/");
        assert_eq!(api.base_url(), "http://relief.local");
        assert_eq!(api.resolve("/api/donors"), "http://relief.local/api/donors");
        assert_eq!(api.resolve("api/donors"), "http://relief.local/api/donors");
        assert_eq!(
            api.resolve("https://other.example/api/x"),
            "https://other.example/api/x"
        );
    }

    #[test]
    fn test_replay_error_display() {
        let err = ReplayError::Rejected {
            status: 500,
            message: None,
        };
        assert_eq!(err.to_string(), "rejected with status 500: no error message");
        assert_eq!(err.status(), Some(500));

        let err = ReplayError::Rejected {
            status: 422,
            message: Some("Invalid blood group".to_string()),
        };
        assert!(err.to_string().contains("Invalid blood group"));
        assert_eq!(ReplayError::Transport("x".to_string()).status(), None);
    }

    #[tokio::test]
    async fn test_replay_sends_method_and_body() {
        let (base, server) = serve_once(http_response("201 Created", r#"{"id":"d1"}"#)).await;
        let api = HttpApi::with_client(test_client(), base);

        let mutation = PendingMutation::new(
            "/api/donors",
            HttpMethod::Post,
            json!({"name": "X", "bloodGroup": "O+"}),
        );
        let status = api.replay(&mutation).await.unwrap();
        assert_eq!(status, 201);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/donors HTTP/1.1"));
        assert!(request.contains(r#""bloodGroup":"O+""#));
    }

    #[tokio::test]
    async fn test_replay_rejection_carries_error_message() {
        let (base, server) = serve_once(http_response(
            "422 Unprocessable Entity",
            r#"{"error":"Invalid status"}"#,
        ))
        .await;
        let api = HttpApi::with_client(test_client(), base);

        let mutation = PendingMutation::new("/api/missing/7", HttpMethod::Patch, json!({}));
        let err = api.replay(&mutation).await.unwrap_err();
        assert_eq!(
            err,
            ReplayError::Rejected {
                status: 422,
                message: Some("Invalid status".to_string()),
            }
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("PATCH /api/missing/7"));
    }

    #[tokio::test]
    async fn test_replay_server_error_without_body() {
        let (base, _server) = serve_once(http_response("500 Internal Server Error", "")).await;
        let api = HttpApi::with_client(test_client(), base);

        let mutation = PendingMutation::new("/api/donors", HttpMethod::Post, json!({}));
        let err = api.replay(&mutation).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn test_replay_transport_failure() {
        let api = HttpApi::with_client(test_client(), "http://127.0.0.1:9");
        let mutation = PendingMutation::new("/api/donors", HttpMethod::Post, json!({}));

        let err = api.replay(&mutation).await.unwrap_err();
        assert!(matches!(err, ReplayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_fetch_all_returns_array() {
        let (base, server) = serve_once(http_response(
            "200 OK",
            r#"[{"id":"d1"},{"id":"d2"}]"#,
        ))
        .await;
        let api = HttpApi::with_client(test_client(), base);

        let records = api.fetch_all("/api/donors").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], "d2");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/donors"));
    }

    #[tokio::test]
    async fn test_fetch_all_rejects_non_array() {
        let (base, _server) = serve_once(http_response("200 OK", r#"{"id":"d1"}"#)).await;
        let api = HttpApi::with_client(test_client(), base);

        let err = api.fetch_all("/api/donors").await.unwrap_err();
        assert!(matches!(err, ReplayError::Decode(_)));
        assert!(err.to_string().contains("an object"));
    }
}
