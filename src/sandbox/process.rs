//! Subprocess-backed sandbox runtime.
//!
//! The code string is handed to an interpreter as its last argument; the
//! process gets a cleared environment (only `PATH` survives), an input
//! payload on stdin, and a line-delimited JSON protocol for store access and
//! the final result:
//!
//! ```text
//! host -> child (first line): {"input":..., "secrets":{...}, "kv":bool}
//! child -> host: {"op":"kv_get","key":"..."} | {"op":"kv_put","key":"...","value":...}
//! host -> child: {"ok":true,"value":...} | {"ok":false,"error":"..."}
//! child -> host: {"op":"result","value":...} | {"op":"fail","error":"..."}
//! ```
//!
//! The run races the declared timeout; the loser is killed and its eventual
//! output discarded. Non-JSON stdout lines are treated as chatter and
//! ignored.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};

use crate::errors::{EngineError, EngineResult};
use crate::sandbox::{CapabilityMeta, SandboxRuntime, ScopedKv};

const STDERR_TAIL_LIMIT: usize = 4096;

pub struct ProcessSandbox {
    interpreter: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(interpreter: Vec<String>) -> Self {
        Self { interpreter }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(vec!["python3".to_string(), "-c".to_string()])
    }
}

#[derive(Debug, Deserialize)]
struct ChildMessage {
    op: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl SandboxRuntime for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(
        &self,
        capability: &str,
        code: &str,
        meta: &CapabilityMeta,
        input: Value,
        secrets: Map<String, Value>,
        kv: Option<ScopedKv>,
    ) -> EngineResult<Value> {
        let argv = meta
            .runtime
            .clone()
            .unwrap_or_else(|| self.interpreter.clone());
        let Some(program) = argv.first() else {
            return Err(EngineError::Sandbox {
                capability: capability.to_string(),
                reason: "empty interpreter argv".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .arg(code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);
        // Zero ambient authority: no inherited environment beyond PATH.
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::Sandbox {
            capability: capability.to_string(),
            reason: format!("spawn failed: {e}"),
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill().await;
            return Err(EngineError::Sandbox {
                capability: capability.to_string(),
                reason: "failed to attach stdio pipes".to_string(),
            });
        };

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr).take(STDERR_TAIL_LIMIT as u64);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let timeout = Duration::from_millis(meta.timeout_ms.max(1));
        let driven = tokio::time::timeout(
            timeout,
            drive(capability, stdin, stdout, input, secrets, kv.as_ref()),
        )
        .await;

        match driven {
            Err(_) => {
                // Timeout is a failure, not a partial result.
                let _ = child.kill().await;
                stderr_task.abort();
                Err(EngineError::Timeout {
                    what: format!("capability '{capability}'"),
                    ms: meta.timeout_ms,
                })
            }
            Ok(Ok(value)) => {
                let _ = child.wait().await;
                stderr_task.abort();
                Ok(value)
            }
            Ok(Err(reason)) => {
                let _ = child.kill().await;
                let tail = stderr_task.await.unwrap_or_default();
                let reason = if tail.trim().is_empty() {
                    reason
                } else {
                    format!("{reason}; stderr: {}", tail.trim())
                };
                Err(EngineError::Sandbox {
                    capability: capability.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Feed the payload, serve store requests, and wait for the result line.
/// Errors come back as plain strings so the caller can attach stderr.
async fn drive(
    capability: &str,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    input: Value,
    secrets: Map<String, Value>,
    kv: Option<&ScopedKv>,
) -> Result<Value, String> {
    let payload = json!({
        "input": input,
        "secrets": Value::Object(secrets),
        "kv": kv.is_some(),
    });
    let mut line = payload.to_string();
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("failed to write payload: {e}"))?;
    stdin
        .flush()
        .await
        .map_err(|e| format!("failed to flush payload: {e}"))?;

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("failed reading output: {e}"))?
    {
        let Ok(msg) = serde_json::from_str::<ChildMessage>(&line) else {
            tracing::trace!(capability, line = %line, "sandbox chatter ignored");
            continue;
        };
        let reply = match msg.op.as_str() {
            "result" => return Ok(msg.value.unwrap_or(Value::Null)),
            "fail" => {
                return Err(msg.error.unwrap_or_else(|| "capability reported failure".into()))
            }
            "kv_get" => match (kv, msg.key) {
                (Some(kv), Some(key)) => match kv.get(&key).await {
                    Ok(value) => json!({"ok": true, "value": value}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                },
                _ => json!({"ok": false, "error": "no store access"}),
            },
            "kv_put" => match (kv, msg.key) {
                (Some(kv), Some(key)) => {
                    match kv.put(&key, &msg.value.unwrap_or(Value::Null)).await {
                        Ok(()) => json!({"ok": true, "value": null}),
                        Err(e) => json!({"ok": false, "error": e.to_string()}),
                    }
                }
                _ => json!({"ok": false, "error": "no store access"}),
            },
            other => json!({"ok": false, "error": format!("unknown op '{other}'")}),
        };
        let mut reply = reply.to_string();
        reply.push('\n');
        stdin
            .write_all(reply.as_bytes())
            .await
            .map_err(|e| format!("failed to answer request: {e}"))?;
        stdin
            .flush()
            .await
            .map_err(|e| format!("failed to flush answer: {e}"))?;
    }

    Err("exited without a result".to_string())
}
