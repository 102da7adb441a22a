//! Reasoning backend driven through an agent CLI.
//!
//! Spawns `<cmd> -p --verbose --output-format stream-json --model <model> <prompt>`
//! and extracts the assistant's text from the newline-delimited JSON stream.
//! The caller bounds the wall-clock time; dropping the future kills the child.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use build_core::Config;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{AgentError, AgentRequest, AgentResponse, ReasoningBackend};

/// Interval between progress log lines while the agent runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Wait for pipe readers after the process exits.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from either stream.
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Stderr lines kept when the agent fails.
const TAIL_LINES: usize = 40;

/// Agent CLI configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: String,
    pub model: String,
    /// Per-invocation limit (0 = none; the controller's stage timeout still applies).
    pub timeout_sec: u64,
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.agent_cmd.clone(),
            model: config.agent_model.clone(),
            timeout_sec: config.stage_timeout_sec,
        }
    }
}

/// Reasoning backend that shells out to an agent CLI.
#[derive(Debug)]
pub struct CliAgent {
    config: AgentConfig,
}

impl CliAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReasoningBackend for CliAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("-p")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&self.config.model)
            .arg(&request.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(stage = %request.stage, model = %self.config.model, "spawning agent");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Unavailable(format!("{} not found", self.config.command))
            } else {
                AgentError::Unavailable(e.to_string())
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_stream_json(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let limit = Duration::from_secs(self.config.timeout_sec);
        let status = loop {
            let elapsed = started.elapsed();
            if self.config.timeout_sec > 0 && elapsed >= limit {
                warn!(stage = %request.stage, timeout_sec = self.config.timeout_sec, "agent timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out agent");
                }
                let _ = child.wait().await;
                return Err(AgentError::Timeout(self.config.timeout_sec));
            }

            let remaining = if self.config.timeout_sec > 0 {
                limit.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };

            tokio::select! {
                result = child.wait() => {
                    break result.map_err(|e| AgentError::Unavailable(e.to_string()))?;
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        stage = %request.stage,
                        elapsed_sec = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        };

        let stream = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(stream))) => stream,
                Ok(Ok(Err(err))) => return Err(AgentError::Malformed(err.to_string())),
                Ok(Err(err)) => return Err(AgentError::Malformed(err.to_string())),
                Err(_) => return Err(AgentError::Malformed("stdout capture timed out".to_string())),
            },
            None => StreamText::default(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).to_string(),
                _ => String::new(),
            },
            None => String::new(),
        };

        let mut raw_errors = stream.errors;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            let tail = tail_lines(&stderr, TAIL_LINES);
            raw_errors.push(if tail.trim().is_empty() {
                format!("agent exited with code {exit_code}")
            } else {
                tail
            });
        }

        info!(
            stage = %request.stage,
            exit_code,
            output_bytes = stream.text.len(),
            errors = raw_errors.len(),
            "agent finished"
        );

        Ok(AgentResponse {
            output: stream.text,
            raw_errors,
        })
    }
}

/// Text and error results pulled from a stream-json transcript.
#[derive(Debug, Default)]
struct StreamText {
    text: String,
    errors: Vec<String>,
}

/// Parse `--output-format stream-json` output.
///
/// Text comes from `content_block_delta` text deltas. When no deltas appear
/// (non-streaming transcripts), the `assistant` message text blocks are used.
/// A `result` event with `is_error` contributes a raw error.
async fn read_stream_json<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    max_bytes: usize,
) -> std::io::Result<StreamText> {
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut deltas = String::new();
    let mut messages = String::new();
    let mut errors = Vec::new();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(event) => event,
            Err(err) => {
                debug!(line = trimmed, error = %err, "ignoring unparseable stream-json line");
                continue;
            }
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = &event["delta"];
                if delta["type"] == "text_delta" {
                    if let Some(text) = delta["text"].as_str() {
                        push_bounded(&mut deltas, text, max_bytes);
                    }
                }
            }
            Some("assistant") => {
                if let Some(blocks) = event["message"]["content"].as_array() {
                    for block in blocks {
                        if block["type"] == "text" {
                            if let Some(text) = block["text"].as_str() {
                                push_bounded(&mut messages, text, max_bytes);
                            }
                        }
                    }
                }
            }
            Some("result") if event["is_error"] == true => {
                let detail = event["result"]
                    .as_str()
                    .unwrap_or("agent reported an error")
                    .to_string();
                errors.push(detail);
            }
            _ => {}
        }
    }

    Ok(StreamText {
        text: if deltas.is_empty() { messages } else { deltas },
        errors,
    })
}

fn push_bounded(buf: &mut String, text: &str, max_bytes: usize) {
    let remaining = max_bytes.saturating_sub(buf.len());
    if remaining == 0 {
        return;
    }
    if text.len() <= remaining {
        buf.push_str(text);
        return;
    }
    let mut cut = remaining;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    warn!(max_bytes, "agent output exceeded limit, truncating");
    buf.push_str(&text[..cut]);
}

/// Read from an async reader with a maximum byte limit, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let to_take = n.min(max_bytes.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use build_core::Stage;

    #[tokio::test]
    async fn stream_json_extracts_text_deltas() {
        let input = concat!(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            "\n",
            "not json\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":" world"}}"#,
            "\n",
        );
        let parsed = read_stream_json(input.as_bytes(), MAX_OUTPUT_BYTES)
            .await
            .unwrap();
        assert_eq!(parsed.text, "Hello world");
        assert!(parsed.errors.is_empty());
    }

    #[tokio::test]
    async fn stream_json_falls_back_to_assistant_messages() {
        let input = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Plan: "},{"type":"tool_use"},{"type":"text","text":"ship it"}]}}"#,
            "\n",
            r#"{"type":"result","is_error":false,"result":"Plan: ship it"}"#,
            "\n",
        );
        let parsed = read_stream_json(input.as_bytes(), MAX_OUTPUT_BYTES)
            .await
            .unwrap();
        assert_eq!(parsed.text, "Plan: ship it");
        assert!(parsed.errors.is_empty());
    }

    #[tokio::test]
    async fn stream_json_collects_error_results() {
        let input = r#"{"type":"result","is_error":true,"result":"rate limited"}"#;
        let parsed = read_stream_json(input.as_bytes(), MAX_OUTPUT_BYTES)
            .await
            .unwrap();
        assert_eq!(parsed.errors, vec!["rate limited"]);
    }

    #[tokio::test]
    async fn stream_json_truncates_at_limit() {
        let input = concat!(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"abcdef"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"ghij"}}"#,
            "\n",
        );
        let parsed = read_stream_json(input.as_bytes(), 8).await.unwrap();
        assert_eq!(parsed.text, "abcdefgh");
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let agent = CliAgent::new(AgentConfig {
            command: "/nonexistent/agent-cli".to_string(),
            model: "sonnet".to_string(),
            timeout_sec: 5,
        });
        let err = agent
            .invoke(AgentRequest {
                stage: Stage::Planning,
                prompt: "plan".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));
    }

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invokes_cli_and_reports_nonzero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let command = script(
            &dir,
            r#"echo '{"type":"content_block_delta","delta":{"type":"text_delta","text":"partial"}}'
echo 'quota exceeded' >&2
exit 2"#,
        );
        let agent = CliAgent::new(AgentConfig {
            command,
            model: "sonnet".to_string(),
            timeout_sec: 10,
        });
        let response = agent
            .invoke(AgentRequest {
                stage: Stage::Building,
                prompt: "build".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.output, "partial");
        assert_eq!(response.raw_errors, vec!["quota exceeded"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_agent_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let command = script(&dir, "sleep 5");
        let agent = CliAgent::new(AgentConfig {
            command,
            model: "sonnet".to_string(),
            timeout_sec: 1,
        });
        let err = agent
            .invoke(AgentRequest {
                stage: Stage::Planning,
                prompt: "plan".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(1)));
    }
}
