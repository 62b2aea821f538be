//! Provider API for remote cloud sandboxes.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackendError, Result};

/// Slack added to the HTTP timeout of a remote execution on top of the
/// command's own timeout.
const EXECUTE_HTTP_GRACE: Duration = Duration::from_secs(30);
const CONTROL_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_stop_interval: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Seconds.
    pub timeout: u64,
}

/// Result of a remote command. The provider merges stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExecution {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(default)]
    pub result: String,
}

/// Narrow view of a sandbox provider.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<SandboxHandle>;

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn execute(&self, sandbox_id: &str, command: &RemoteCommand) -> Result<RemoteExecution>;

    async fn upload_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;
}

/// JSON-over-HTTPS client for a Daytona-style sandbox provider.
pub struct HttpSandboxApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpSandboxApi {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ralph/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| BackendError::InvalidArgument(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Transport(format!(
            "HTTP {status}: {}",
            body.chars().take(500).collect::<String>()
        )))
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<SandboxHandle> {
        let response = self
            .send(
                self.client
                    .post(self.url("/sandbox"))
                    .timeout(CONTROL_HTTP_TIMEOUT)
                    .json(request),
            )
            .await?;
        response.json().await.map_err(transport_error)
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/sandbox/{sandbox_id}")))
                .query(&[("force", "true")])
                .timeout(CONTROL_HTTP_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn execute(&self, sandbox_id: &str, command: &RemoteCommand) -> Result<RemoteExecution> {
        debug!(sandbox = %sandbox_id, timeout_s = command.timeout, "remote execute");
        let response = self
            .send(
                self.client
                    .post(self.url(&format!(
                        "/toolbox/{sandbox_id}/toolbox/process/execute"
                    )))
                    .timeout(Duration::from_secs(command.timeout) + EXECUTE_HTTP_GRACE)
                    .json(command),
            )
            .await?;
        response.json().await.map_err(transport_error)
    }

    async fn upload_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&format!("/toolbox/{sandbox_id}/toolbox/files")))
                .query(&[("path", path)])
                .timeout(CONTROL_HTTP_TIMEOUT)
                .body(contents.to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/toolbox/{sandbox_id}/toolbox/files")))
                    .query(&[("path", path)])
                    .timeout(CONTROL_HTTP_TIMEOUT),
            )
            .await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

/// Flatten a reqwest error and its source chain into a classifiable message.
fn transport_error(err: reqwest::Error) -> BackendError {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    if err.is_timeout() {
        message = format!("request timed out: {message}");
    } else if err.is_connect() {
        message = format!("network connect error: {message}");
    }
    BackendError::Transport(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_uses_provider_field_names() {
        let req = CreateSandboxRequest {
            language: Some("typescript".into()),
            labels: BTreeMap::from([("ralph.backend".to_string(), "cloud-1".to_string())]),
            auto_stop_interval: Some(30),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["autoStopInterval"], 30);
        assert_eq!(json["labels"]["ralph.backend"], "cloud-1");
    }

    #[test]
    fn remote_execution_parses_exit_code() {
        let exec: RemoteExecution =
            serde_json::from_str(r#"{"exitCode": 2, "result": "boom"}"#).unwrap();
        assert_eq!(exec.exit_code, 2);
        assert_eq!(exec.result, "boom");
    }

    #[tokio::test]
    async fn unreachable_provider_is_transient() {
        // Port 9 on localhost is almost never listening.
        let api = HttpSandboxApi::new("http://127.0.0.1:9", "key").unwrap();
        let err = api.delete_sandbox("sb-1").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
