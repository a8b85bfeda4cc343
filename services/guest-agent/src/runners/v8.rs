//! JavaScript function workloads, hosted in a persistent interpreter.
//!
//! The workload script is loaded by a small harness that speaks NDJSON on
//! stdin/stdout. Requests are `{"subject", "payload"}` with a base64 payload,
//! responses are `{"ok": true, "payload"}` or `{"ok": false, "error"}`. The
//! harness writes console output to stderr as log entries, so stdout carries
//! nothing but protocol lines.
//!
//! A workload exports its handler as `module.exports = (subject, payload) =>
//! ...`, as `exports.run`, or defines a global `run`. The handler may return
//! a string, bytes, any JSON value, or a promise of one.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kiln_agent_api::{level, GuestDeploy, LogEntry, WorkloadType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{remove_staged, spawn_log_pump, stage_file, RunnerContext, WorkloadRunner};
use crate::error::GuestError;

const SCRIPT_NAME: &str = "workload.js";
const HARNESS_NAME: &str = "harness.js";
const READY_TIMEOUT: Duration = Duration::from_secs(10);

const HARNESS: &str = r#"'use strict';
const path = require('path');
const readline = require('readline');

const emit = (level) => (...args) => {
  const text = args.map((a) => (typeof a === 'string' ? a : JSON.stringify(a))).join(' ');
  process.stderr.write(JSON.stringify({ text, level }) + '\n');
};
console.debug = emit(-4);
console.log = emit(0);
console.info = emit(0);
console.warn = emit(4);
console.error = emit(8);

const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

let handler;
try {
  const exported = require(path.join(__dirname, 'workload.js'));
  handler =
    typeof exported === 'function' ? exported
    : exported && typeof exported.run === 'function' ? exported.run
    : typeof globalThis.run === 'function' ? globalThis.run
    : null;
} catch (err) {
  reply({ ready: false, error: String(err && err.stack || err) });
  process.exit(1);
}
if (!handler) {
  reply({ ready: false, error: 'workload does not export a handler' });
  process.exit(1);
}
reply({ ready: true });

const encode = (value) => {
  if (value === undefined || value === null) return '';
  if (typeof value === 'string') return Buffer.from(value).toString('base64');
  if (value instanceof Uint8Array) return Buffer.from(value).toString('base64');
  return Buffer.from(JSON.stringify(value)).toString('base64');
};

const lines = readline.createInterface({ input: process.stdin });
let queue = Promise.resolve();
lines.on('line', (line) => {
  queue = queue.then(async () => {
    try {
      const req = JSON.parse(line);
      const result = await handler(req.subject, Buffer.from(req.payload, 'base64'));
      reply({ ok: true, payload: encode(result) });
    } catch (err) {
      reply({ ok: false, error: String(err && err.message || err) });
    }
  });
});
lines.on('close', () => queue.then(() => process.exit(0)));
"#;

#[derive(Serialize)]
struct Invocation<'a> {
    subject: &'a str,
    payload: String,
}

#[derive(Deserialize)]
struct Ready {
    ready: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Outcome {
    ok: bool,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    logs: JoinHandle<()>,
}

impl Interpreter {
    async fn read_line(&mut self, timeout: Duration) -> Result<String, String> {
        match tokio::time::timeout(timeout, self.stdout.next_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err("interpreter exited".to_string()),
            Ok(Err(e)) => Err(format!("interpreter read failed: {e}")),
            Err(_) => Err(format!("no response within {timeout:?}")),
        }
    }

    async fn call(&mut self, line: &[u8], timeout: Duration) -> Result<String, String> {
        self.stdin
            .write_all(line)
            .await
            .map_err(|e| format!("interpreter write failed: {e}"))?;
        self.stdin.flush().await.map_err(|e| e.to_string())?;
        self.read_line(timeout).await
    }

    async fn shutdown(mut self) {
        drop(self.stdin);
        if tokio::time::timeout(Duration::from_secs(1), self.child.wait())
            .await
            .is_err()
        {
            self.child.kill().await.ok();
        }
        self.logs.abort();
    }
}

pub struct V8Runner {
    deploy: GuestDeploy,
    ctx: RunnerContext,
    interpreter: Mutex<Option<Interpreter>>,
}

impl V8Runner {
    pub fn new(deploy: GuestDeploy, ctx: RunnerContext) -> Self {
        Self {
            deploy,
            ctx,
            interpreter: Mutex::new(None),
        }
    }

    fn staged_files(&self) -> [PathBuf; 2] {
        let work_dir = &self.ctx.config.work_dir;
        [work_dir.join(SCRIPT_NAME), work_dir.join(HARNESS_NAME)]
    }
}

/// Interpreter stderr carries JSON log entries; anything else, such as an
/// uncaught exception trace, is reported as an error line.
fn stderr_entry(line: String) -> LogEntry {
    LogEntry::decode(line.as_bytes()).unwrap_or_else(|_| LogEntry::new(level::ERROR, line))
}

#[async_trait]
impl WorkloadRunner for V8Runner {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::V8
    }

    async fn start(&self) -> Result<(), GuestError> {
        let mut slot = self.interpreter.lock().await;
        if slot.is_some() {
            return Err(GuestError::AlreadyDeployed);
        }

        let config = &self.ctx.config;
        let stage_err =
            |e: std::io::Error| GuestError::WorkloadStartFailed(format!("failed to stage script: {e}"));
        stage_file(&config.work_dir, SCRIPT_NAME, &self.deploy.artifact, 0o644)
            .await
            .map_err(stage_err)?;
        let harness = stage_file(&config.work_dir, HARNESS_NAME, HARNESS.as_bytes(), 0o644)
            .await
            .map_err(stage_err)?;

        let mut command = Command::new(&config.js_interpreter);
        command.arg(&harness).env_clear();
        // The interpreter itself is found on the agent's PATH.
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        let mut child = command
            .envs(&self.deploy.environment)
            .current_dir(&config.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GuestError::WorkloadStartFailed(format!(
                    "failed to start {}: {e}",
                    config.js_interpreter.display()
                ))
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(GuestError::WorkloadStartFailed(
                "interpreter pipes unavailable".to_string(),
            ));
        };

        let logs = spawn_log_pump(stderr, &self.ctx, stderr_entry);
        let mut interpreter = Interpreter {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            logs,
        };

        let ready = interpreter
            .read_line(READY_TIMEOUT)
            .await
            .and_then(|line| serde_json::from_str::<Ready>(&line).map_err(|e| e.to_string()));
        match ready {
            Ok(Ready { ready: true, .. }) => {}
            Ok(Ready { error, .. }) => {
                interpreter.shutdown().await;
                return Err(GuestError::WorkloadStartFailed(
                    error.unwrap_or_else(|| "script failed to load".to_string()),
                ));
            }
            Err(e) => {
                interpreter.shutdown().await;
                return Err(GuestError::WorkloadStartFailed(e));
            }
        }

        info!(
            machine_id = %config.machine_id,
            workload = %self.deploy.workload_name,
            pid = ?interpreter.child.id(),
            "JavaScript workload loaded"
        );
        *slot = Some(interpreter);
        Ok(())
    }

    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, GuestError> {
        let mut slot = self.interpreter.lock().await;
        let interpreter = slot.as_mut().ok_or(GuestError::NotDeployed)?;

        let mut line = serde_json::to_vec(&Invocation {
            subject,
            payload: BASE64.encode(&payload),
        })
        .map_err(|e| GuestError::Execute(e.to_string()))?;
        line.push(b'\n');

        let response = match interpreter.call(&line, self.ctx.config.execute_timeout).await {
            Ok(response) => response,
            Err(e) => {
                // The stream is out of step with requests now; drop it.
                warn!(machine_id = %self.ctx.config.machine_id, error = %e, "Interpreter failed, discarding");
                if let Some(interpreter) = slot.take() {
                    interpreter.shutdown().await;
                }
                return Err(GuestError::Execute(e));
            }
        };

        let outcome: Outcome = serde_json::from_str(&response)
            .map_err(|e| GuestError::Execute(format!("malformed interpreter response: {e}")))?;
        if !outcome.ok {
            return Err(GuestError::Execute(
                outcome.error.unwrap_or_else(|| "handler failed".to_string()),
            ));
        }

        BASE64
            .decode(outcome.payload.unwrap_or_default())
            .map_err(|e| GuestError::Execute(format!("malformed response payload: {e}")))
    }

    async fn stop(&self) -> Result<(), GuestError> {
        if let Some(interpreter) = self.interpreter.lock().await.take() {
            debug!(machine_id = %self.ctx.config.machine_id, "Stopping interpreter");
            interpreter.shutdown().await;
        }
        for path in self.staged_files() {
            remove_staged(&path)
                .await
                .map_err(|e| GuestError::StopFailed(format!("failed to remove {}: {e}", path.display())))?;
        }
        Ok(())
    }
}
