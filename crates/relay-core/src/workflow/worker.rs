//! Worker runner contract and the two shipped runners.
//!
//! A worker receives one [`DispatchRequest`] and answers with a single JSON
//! document:
//!
//! ```json
//! { "status": "success", "output": { ... } }
//! { "status": "failure", "error": { "message": "..." } }
//! ```
//!
//! Runners only move bytes; [`interpret_response`] decides whether the answer
//! is well-formed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::workflow::dispatcher::DispatchRequest;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker process failed: {0}")]
    Process(String),

    #[error("worker transport failed: {0}")]
    Transport(String),

    #[error("worker timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// Executes a dispatched step in isolation.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Run the request and return the worker's raw answer. Non-JSON output
    /// is returned as a JSON string so it can be reported as malformed.
    async fn execute(&self, request: &DispatchRequest, timeout: Duration) -> Result<Value, WorkerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A well-formed worker answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Validate a raw answer. `Err` carries the reason it is malformed.
///
/// `error` may be an object with `message` or a bare string. A success for a
/// step that produces an output must carry `output`.
pub fn interpret_response(raw: &Value, expects_output: bool) -> Result<StepResult, String> {
    let obj = match raw {
        Value::Object(obj) => obj,
        Value::String(text) => {
            return Err(format!(
                "response is not JSON: {}",
                text.chars().take(200).collect::<String>()
            ))
        }
        other => return Err(format!("response is not a JSON object: {}", other)),
    };

    let status = match obj.get("status").and_then(Value::as_str) {
        Some("success") => StepStatus::Success,
        Some("failure") => StepStatus::Failure,
        Some(other) => return Err(format!("unknown status '{}'", other)),
        None => return Err("response has no 'status' field".to_string()),
    };

    let output = obj.get("output").filter(|v| !v.is_null()).cloned();
    if status == StepStatus::Success && expects_output && output.is_none() {
        return Err("success response is missing 'output'".to_string());
    }

    let error = match obj.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(ErrorInfo {
            message: message.clone(),
            code: None,
        }),
        Some(value) => Some(
            serde_json::from_value::<ErrorInfo>(value.clone())
                .map_err(|e| format!("invalid 'error' field: {}", e))?,
        ),
    };

    Ok(StepResult { status, output, error })
}

fn parse_document(text: &str) -> Value {
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Spawns a shell command per dispatch, writes the request JSON to its stdin
/// and reads one JSON document from its stdout.
pub struct CommandWorkerRunner {
    command: String,
}

impl CommandWorkerRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl WorkerRunner for CommandWorkerRunner {
    async fn execute(&self, request: &DispatchRequest, timeout: Duration) -> Result<Value, WorkerError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| WorkerError::Process(format!("failed to encode request: {}", e)))?;

        tracing::info!(
            "[CommandWorker] Running step {} (attempt {}) via `{}`",
            request.step_id,
            request.attempt,
            self.command
        );

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RELAY_INSTANCE_ID", &request.instance_id)
            .env("RELAY_STEP_ID", &request.step_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Process(format!("failed to spawn `{}`: {}", self.command, e)))?;

        // Fed while stdout is drained; a worker may answer without reading
        // its stdin, so a closed pipe is not an error.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&body).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (fed, output) = tokio::time::timeout(timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| WorkerError::Timeout(timeout))?;
        let output = output.map_err(|e| WorkerError::Process(e.to_string()))?;
        fed.map_err(|e| WorkerError::Process(format!("failed to write request: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::Process(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_document(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// POSTs the request JSON to an HTTP endpoint and reads the JSON body back.
pub struct HttpWorkerRunner {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerRunner {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
        }
    }
}

#[async_trait]
impl WorkerRunner for HttpWorkerRunner {
    async fn execute(&self, request: &DispatchRequest, timeout: Duration) -> Result<Value, WorkerError> {
        tracing::info!(
            "[HttpWorker] POST {} for step {} (attempt {})",
            self.url,
            request.step_id,
            request.attempt
        );

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::Timeout(timeout)
                } else {
                    WorkerError::Transport(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| WorkerError::Transport(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(WorkerError::Transport(format!("endpoint returned {}: {}", status, text)));
        }

        Ok(parse_document(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::catalog::{CatalogEntry, EntryKind};
    use serde_json::json;

    fn request() -> DispatchRequest {
        let entry = |id: &str, kind| CatalogEntry {
            id: id.into(),
            kind,
            name: id.into(),
            description: None,
            path: "/dev/null".into(),
            origin: "core".into(),
        };
        DispatchRequest {
            instance_id: "inst-1".into(),
            step_id: "draft".into(),
            resolved_agent: entry("writer", EntryKind::Agent),
            resolved_task: entry("draft", EntryKind::Task),
            input_payload: json!({ "topic": "rust" }),
            attempt: 1,
        }
    }

    #[test]
    fn test_interpret_success_and_failure() {
        let ok = interpret_response(&json!({"status": "success", "output": {"n": 1}}), true).unwrap();
        assert_eq!(ok.status, StepStatus::Success);
        assert_eq!(ok.output, Some(json!({"n": 1})));

        let failed = interpret_response(&json!({"status": "failure", "error": "boom"}), true).unwrap();
        assert_eq!(failed.status, StepStatus::Failure);
        assert_eq!(failed.error.unwrap().message, "boom");

        let structured =
            interpret_response(&json!({"status": "failure", "error": {"message": "x", "code": "E1"}}), false)
                .unwrap();
        assert_eq!(structured.error.unwrap().code.as_deref(), Some("E1"));
    }

    #[test]
    fn test_interpret_malformed() {
        assert!(interpret_response(&json!("plain text"), false).is_err());
        assert!(interpret_response(&json!([1, 2]), false).is_err());
        assert!(interpret_response(&json!({"output": 1}), false).is_err());
        assert!(interpret_response(&json!({"status": "maybe"}), false).is_err());
        assert!(interpret_response(&json!({"status": "success"}), true).is_err());
        assert!(interpret_response(&json!({"status": "success"}), false).is_ok());
    }

    #[tokio::test]
    async fn test_command_runner_round_trip() {
        // `cat` echoes the request back; the request is a JSON object without `status`.
        let runner = CommandWorkerRunner::new("cat");
        let raw = runner.execute(&request(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(raw["stepId"], "draft");
        assert_eq!(raw["inputPayload"]["topic"], "rust");
    }

    #[tokio::test]
    async fn test_command_runner_answers() {
        let runner = CommandWorkerRunner::new(
            r#"cat > /dev/null; echo '{"status":"success","output":"done"}'"#,
        );
        let raw = runner.execute(&request(), Duration::from_secs(5)).await.unwrap();
        let result = interpret_response(&raw, true).unwrap();
        assert_eq!(result.output, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_command_runner_non_json_and_exit_code() {
        let runner = CommandWorkerRunner::new("cat > /dev/null; echo hello");
        let raw = runner.execute(&request(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(raw, json!("hello"));

        let runner = CommandWorkerRunner::new("cat > /dev/null; echo bad >&2; exit 3");
        let err = runner.execute(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Process(ref m) if m.contains("bad")));
    }

    #[tokio::test]
    async fn test_command_runner_timeout() {
        let runner = CommandWorkerRunner::new("sleep 5");
        let err = runner
            .execute(&request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
    }

    fn large_request() -> DispatchRequest {
        DispatchRequest {
            input_payload: json!({ "blob": "x".repeat(1 << 20) }),
            ..request()
        }
    }

    #[tokio::test]
    async fn test_command_runner_worker_ignoring_stdin() {
        let runner = CommandWorkerRunner::new(r#"echo '{"status":"success","output":1}'"#);
        let raw = runner
            .execute(&large_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(interpret_response(&raw, true).unwrap().output, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_command_runner_large_stdout_before_reading_stdin() {
        // 128 KiB of output is written before the request is read
        let runner = CommandWorkerRunner::new(
            r#"printf '{"status":"success","output":"'; head -c 131072 /dev/zero | tr '\0' x; printf '"}'; cat > /dev/null"#,
        );
        let raw = runner
            .execute(&large_request(), Duration::from_secs(5))
            .await
            .unwrap();
        let output = interpret_response(&raw, true).unwrap().output.unwrap();
        assert_eq!(output.as_str().unwrap().len(), 131072);
    }

    /// Serves a single canned HTTP response and returns the request it read.
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().to_string())
                        })
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_http_runner_posts_request() {
        let (url, server) = serve_once(r#"{"status":"success","output":"posted"}"#).await;
        let runner = HttpWorkerRunner::new(url);
        let raw = runner.execute(&request(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(interpret_response(&raw, true).unwrap().output, Some(json!("posted")));

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /run"));
        assert!(received.contains(r#""stepId":"draft""#));
    }

    #[tokio::test]
    async fn test_http_runner_unreachable_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());
        drop(listener);

        let err = HttpWorkerRunner::new(url)
            .execute(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }
}
