//! Verification of subtask results.
//!
//! The engine only looks at [`VerificationResult::passed`]; everything else is
//! kept for reports.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{VerificationResult, VerificationSpec};

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, subtask_id: &str, spec: &VerificationSpec) -> VerificationResult;
}

/// Runs `command`/`e2e` checks through `sh -c` and `api` checks over HTTP.
/// Browser checks need an external driver and always report unsupported.
pub struct ShellVerifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl ShellVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            timeout,
        }
    }

    async fn run_command(&self, command: &str, logs: &mut Vec<String>) -> Result<(), String> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn `{}`: {}", command, e))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("`{}` timed out after {}s", command, self.timeout.as_secs()))?
            .map_err(|e| e.to_string())?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        logs.push(format!("$ {}", command));
        logs.extend(stdout.lines().map(String::from));
        logs.extend(stderr.lines().map(String::from));

        if output.status.success() {
            Ok(())
        } else {
            Err(format!("`{}` exited with {}", command, output.status))
        }
    }

    async fn check_api(
        &self,
        url: &str,
        method: &str,
        expected_status: u16,
        logs: &mut Vec<String>,
    ) -> Result<(), String> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method '{}'", method))?;
        let response = self
            .client
            .request(method.clone(), url)
            .send()
            .await
            .map_err(|e| format!("{} {} failed: {}", method, url, e))?;
        let status = response.status().as_u16();
        logs.push(format!("{} {} -> {}", method, url, status));
        if status == expected_status {
            Ok(())
        } else {
            Err(format!("expected status {}, got {}", expected_status, status))
        }
    }
}

impl Default for ShellVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Verifier for ShellVerifier {
    async fn verify(&self, subtask_id: &str, spec: &VerificationSpec) -> VerificationResult {
        let mut logs = Vec::new();
        let outcome = match spec {
            VerificationSpec::Command { command } | VerificationSpec::E2e { command } => {
                self.run_command(command, &mut logs).await
            }
            VerificationSpec::Api {
                url,
                method,
                expected_status,
            } => self.check_api(url, method, *expected_status, &mut logs).await,
            VerificationSpec::Browser { .. } => {
                Err("browser verification is not supported by the shell verifier".to_string())
            }
        };

        match outcome {
            Ok(()) => tracing::info!("[Verifier] {} passed ({})", subtask_id, spec.kind()),
            Err(ref e) => tracing::warn!("[Verifier] {} failed ({}): {}", subtask_id, spec.kind(), e),
        }

        VerificationResult {
            subtask_id: subtask_id.to_string(),
            passed: outcome.is_ok(),
            attempts: 1,
            logs,
            error: outcome.err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_pass_and_fail() {
        let verifier = ShellVerifier::new(Duration::from_secs(5));
        let ok = verifier
            .verify("t1", &VerificationSpec::Command { command: "echo fine".into() })
            .await;
        assert!(ok.passed);
        assert!(ok.logs.iter().any(|l| l == "fine"));

        let bad = verifier
            .verify("t1", &VerificationSpec::E2e { command: "exit 1".into() })
            .await;
        assert!(!bad.passed);
        assert!(bad.error.is_some());
    }

    #[tokio::test]
    async fn test_browser_unsupported() {
        let verifier = ShellVerifier::default();
        let result = verifier
            .verify(
                "ui",
                &VerificationSpec::Browser {
                    url: "http://localhost".into(),
                    selector: "#app".into(),
                    expected_text: None,
                },
            )
            .await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let verifier = ShellVerifier::new(Duration::from_millis(100));
        let result = verifier
            .verify("slow", &VerificationSpec::Command { command: "sleep 5".into() })
            .await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    /// Answers every request with `204 No Content`.
    async fn no_content_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        url
    }

    #[tokio::test]
    async fn test_api_expected_status() {
        let url = no_content_server().await;
        let verifier = ShellVerifier::new(Duration::from_secs(5));

        let ok = verifier
            .verify(
                "api",
                &VerificationSpec::Api {
                    url: url.clone(),
                    method: "get".into(),
                    expected_status: 204,
                },
            )
            .await;
        assert!(ok.passed, "{:?}", ok.error);
        assert!(ok.logs[0].ends_with("-> 204"));

        let bad = verifier
            .verify(
                "api",
                &VerificationSpec::Api {
                    url,
                    method: "GET".into(),
                    expected_status: 200,
                },
            )
            .await;
        assert!(!bad.passed);
        assert_eq!(bad.error.as_deref(), Some("expected status 200, got 204"));
    }
}
