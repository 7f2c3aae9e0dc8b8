//! Typed HTTP client for the remote code kernel.
//!
//! The kernel holds a live interpreter namespace across calls. All endpoints
//! are idempotent except `execute`, `reset`, and `snapshot_restore`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{BridgeError, BridgeResult};

/// Margin added to the HTTP timeout on top of the kernel's own execution
/// timeout, so an overdue cell yields the kernel's structured timeout rather
/// than a torn-down connection.
const EXEC_TIMEOUT_MARGIN_SECS: u64 = 5;

/// HTTP timeout for the small idempotent endpoints.
const QUERY_TIMEOUT_SECS: u64 = 10;

/// HTTP timeout for snapshot transfer (namespaces can be large).
const SNAPSHOT_TIMEOUT_SECS: u64 = 30;

/// Result of executing a code cell in the kernel.
///
/// A non-empty `stderr` with a captured traceback is not a client error;
/// it is returned verbatim for the caller (or a sub-agent trajectory) to
/// react to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub vars: Vec<String>,
}

impl ExecOutcome {
    /// Stdout and stderr combined the way a trajectory records them.
    pub fn combined(&self) -> String {
        match (self.output.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n[stderr] {}", self.output, self.stderr),
            (true, false) => format!("[stderr] {}", self.stderr),
            _ => self.output.clone(),
        }
    }
}

/// Metadata about one variable in the kernel namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub summary: String,
}

/// Names restored / skipped by a snapshot restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    #[serde(default)]
    pub restored: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// Typed client over the kernel's HTTP surface.
#[derive(Clone)]
pub struct KernelClient {
    http: reqwest::Client,
    base_url: String,
}

impl KernelClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a code cell. `timeout_secs` is the kernel-side limit; the HTTP
    /// request allows a margin beyond it.
    pub async fn execute(&self, code: &str, timeout_secs: u64) -> BridgeResult<ExecOutcome> {
        let response = self
            .http
            .post(format!("{}/exec", self.base_url))
            .timeout(Duration::from_secs(timeout_secs + EXEC_TIMEOUT_MARGIN_SECS))
            .json(&json!({"code": code, "timeout": timeout_secs}))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn list_variables(&self) -> BridgeResult<Vec<VariableInfo>> {
        let response = self
            .http
            .get(format!("{}/vars", self.base_url))
            .timeout(Duration::from_secs(QUERY_TIMEOUT_SECS))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Fetch one variable's value. The kernel returns a JSON-safe value or a
    /// repr string for non-serializable objects.
    pub async fn get_variable(&self, name: &str) -> BridgeResult<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/var/{name}", self.base_url))
            .timeout(Duration::from_secs(QUERY_TIMEOUT_SECS))
            .send()
            .await?;
        let body: serde_json::Value = Self::decode(response).await?;
        if let Some(err) = body.get("error").and_then(|e| e.as_str()) {
            return Err(BridgeError::NotFound(format!("variable {name}: {err}")));
        }
        Ok(body.get("value").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Wipe the kernel namespace.
    pub async fn reset(&self) -> BridgeResult<ExecOutcome> {
        self.execute(super::inject::RESET_SOURCE, QUERY_TIMEOUT_SECS)
            .await
    }

    /// Ask the kernel to serialize its namespace. Returns the opaque snapshot
    /// bytes; names that could not be serialized are dropped kernel-side.
    pub async fn snapshot_save(&self) -> BridgeResult<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/snapshot/save", self.base_url))
            .timeout(Duration::from_secs(SNAPSHOT_TIMEOUT_SECS))
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Push snapshot bytes back into the kernel. Atomic kernel-side: either
    /// the namespace is fully replaced or left untouched.
    pub async fn snapshot_restore(&self, snapshot: Vec<u8>) -> BridgeResult<RestoreReport> {
        let response = self
            .http
            .post(format!("{}/snapshot/restore", self.base_url))
            .timeout(Duration::from_secs(SNAPSHOT_TIMEOUT_SECS))
            .body(snapshot)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn health(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        matches!(result, Ok(r) if r.status().is_success())
    }

    fn check_status(response: reqwest::Response) -> BridgeResult<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            return Err(BridgeError::Unavailable("kernel is busy".into()));
        }
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "kernel returned HTTP {}",
                status.as_u16()
            )));
        }
        Ok(response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> BridgeResult<T> {
        let response = Self::check_status(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| BridgeError::Internal(format!("unexpected kernel response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> KernelClient {
        KernelClient::new(reqwest::Client::new(), server.uri())
    }

    #[tokio::test]
    async fn execute_returns_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec"))
            .and(body_json(serde_json::json!({"code": "x = 1", "timeout": 30})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"output": "", "stderr": "", "vars": ["x"]}),
            ))
            .mount(&server)
            .await;

        let outcome = client(&server).execute("x = 1", 30).await.unwrap();
        assert_eq!(outcome.vars, vec!["x"]);
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn execute_surfaces_traceback_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": "",
                "stderr": "ZeroDivisionError: division by zero",
                "vars": []
            })))
            .mount(&server)
            .await;

        let outcome = client(&server).execute("1/0", 30).await.unwrap();
        assert!(outcome.stderr.contains("ZeroDivisionError"));
        assert!(outcome.combined().starts_with("[stderr]"));
    }

    #[tokio::test]
    async fn busy_kernel_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).execute("x", 30).await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[tokio::test]
    async fn malformed_body_is_internal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vars"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server).list_variables().await.unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn list_variables_decodes_type_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vars"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "df", "type": "DataFrame", "summary": "<1000 rows>"}
            ])))
            .mount(&server)
            .await;

        let vars = client(&server).list_variables().await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].type_name, "DataFrame");
    }

    #[tokio::test]
    async fn get_variable_maps_error_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/var/ghost"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "not found"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).get_variable("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn snapshot_roundtrip_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/snapshot/save"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/snapshot/restore"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"restored": ["x"], "skipped": ["sock"]}),
            ))
            .mount(&server)
            .await;

        let c = client(&server);
        let bytes = c.snapshot_save().await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        let report = c.snapshot_restore(bytes).await.unwrap();
        assert_eq!(report.restored, vec!["x"]);
        assert_eq!(report.skipped, vec!["sock"]);
    }

    #[tokio::test]
    async fn health_false_when_down() {
        let c = KernelClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        assert!(!c.health().await);
    }

    #[tokio::test]
    async fn connection_refused_is_transport() {
        let c = KernelClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = c.execute("x", 5).await.unwrap_err();
        assert!(matches!(err.kind(), "transport" | "timeout"));
    }
}
