//! Statically linked ELF binaries, supervised as a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_agent_api::{
    level, subjects, CloudEvent, GuestDeploy, LogEntry, WorkloadType, WORKLOAD_STOPPED_EVENT_TYPE,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{remove_staged, spawn_log_pump, stage_file, RunnerContext, WorkloadRunner};
use crate::error::GuestError;

const BINARY_NAME: &str = "workload";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A running workload process.
struct Supervised {
    pid: Option<u32>,
    /// Exit code once the process has been reaped.
    exited: watch::Receiver<Option<i32>>,
    supervisor: JoinHandle<()>,
}

pub struct ElfRunner {
    deploy: GuestDeploy,
    ctx: RunnerContext,
    process: Mutex<Option<Supervised>>,
    /// Set while `stop` is ending the process, so the exit is not reported
    /// as the workload stopping on its own.
    stopping: Arc<AtomicBool>,
}

impl ElfRunner {
    pub fn new(deploy: GuestDeploy, ctx: RunnerContext) -> Self {
        Self {
            deploy,
            ctx,
            process: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn binary_path(&self) -> PathBuf {
        self.ctx.config.work_dir.join(BINARY_NAME)
    }
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), signal) {
        debug!(pid, signal = ?signal, error = %e, "Signal delivery failed");
    }
}

#[async_trait]
impl WorkloadRunner for ElfRunner {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::Elf
    }

    async fn start(&self) -> Result<(), GuestError> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Err(GuestError::AlreadyDeployed);
        }

        let work_dir = &self.ctx.config.work_dir;
        let path = stage_file(work_dir, BINARY_NAME, &self.deploy.artifact, 0o755)
            .await
            .map_err(|e| GuestError::WorkloadStartFailed(format!("failed to stage binary: {e}")))?;

        let mut child = Command::new(&path)
            .args(&self.deploy.argv)
            .env_clear()
            .envs(&self.deploy.environment)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GuestError::WorkloadStartFailed(format!("spawn failed: {e}")))?;

        let pid = child.id();
        let machine_id = self.ctx.config.machine_id;
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_log_pump(stdout, &self.ctx, |line| {
                LogEntry::new(level::INFO, line)
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_log_pump(stderr, &self.ctx, |line| {
                LogEntry::new(level::ERROR, line)
            }));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let bus = Arc::clone(&self.ctx.bus);
        let events_subject = subjects::events(
            &self.ctx.config.internal_prefix,
            &machine_id,
            WORKLOAD_STOPPED_EVENT_TYPE,
        );
        let workload_name = self.deploy.workload_name.clone();
        let stopping = Arc::clone(&self.stopping);

        let supervisor = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(128),
                Err(e) => {
                    warn!(machine_id = %machine_id, error = %e, "Failed to wait on workload");
                    128
                }
            };
            for pump in pumps {
                pump.await.ok();
            }
            exit_tx.send_replace(Some(code));

            if stopping.load(Ordering::SeqCst) {
                debug!(machine_id = %machine_id, code, "Workload stopped on request");
                return;
            }

            info!(machine_id = %machine_id, workload = %workload_name, exit_code = code, "Workload exited");
            let event = CloudEvent::workload_stopped(&machine_id, &workload_name, code);
            if let Err(e) = bus.publish(&events_subject, event.encode()).await {
                warn!(machine_id = %machine_id, error = %e, "Failed to publish workload_stopped");
            }
        });

        info!(
            machine_id = %machine_id,
            workload = %self.deploy.workload_name,
            pid = ?pid,
            "Workload started"
        );

        *process = Some(Supervised {
            pid,
            exited: exit_rx,
            supervisor,
        });
        Ok(())
    }

    async fn execute(&self, _subject: &str, _payload: Vec<u8>) -> Result<Vec<u8>, GuestError> {
        Err(GuestError::UnsupportedOperation {
            workload_type: WorkloadType::Elf,
            operation: "execute",
        })
    }

    async fn stop(&self) -> Result<(), GuestError> {
        let Some(supervised) = self.process.lock().await.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::SeqCst);

        let mut exited = supervised.exited;
        if exited.borrow().is_none() {
            if let Some(pid) = supervised.pid {
                info!(pid, "Forwarding SIGTERM to workload");
                send_signal(pid, Signal::SIGTERM);
                let graceful = tokio::time::timeout(STOP_GRACE, exited.wait_for(Option::is_some)).await;
                if graceful.is_err() {
                    warn!(pid, "Workload ignored SIGTERM, killing");
                    send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        if tokio::time::timeout(STOP_GRACE, supervised.supervisor).await.is_err() {
            return Err(GuestError::StopFailed("workload did not exit".to_string()));
        }

        remove_staged(&self.binary_path())
            .await
            .map_err(|e| GuestError::StopFailed(format!("failed to remove binary: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, deploy};
    use super::*;
    use kiln_bus::MessageBus;

    #[tokio::test]
    async fn test_supervised_process_reports_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, ctx) = context(dir.path());
        let machine_id = ctx.config.machine_id;

        let mut logs = bus
            .subscribe(&subjects::logs("agentint", &machine_id))
            .await
            .unwrap();
        let mut events = bus
            .subscribe(&subjects::events_wildcard("agentint"))
            .await
            .unwrap();

        // The runner executes whatever it is handed; the host is the one
        // that insists on real ELF images.
        let runner = ElfRunner::new(
            deploy(WorkloadType::Elf, b"#!/bin/sh\necho hello\nexit 3\n".to_vec()),
            ctx,
        );
        runner.start().await.unwrap();

        let line = LogEntry::decode(&logs.next().await.unwrap().payload).unwrap();
        assert_eq!(line.text, "hello");
        assert_eq!(line.level, level::INFO);

        let event = CloudEvent::decode(&events.next().await.unwrap().payload).unwrap();
        assert!(event.is_workload_stopped());
        assert_eq!(event.data.unwrap()["code"], 3);

        runner.stop().await.unwrap();
        assert!(!dir.path().join(BINARY_NAME).exists());
    }

    #[tokio::test]
    async fn test_stop_terminates_running_process_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, ctx) = context(dir.path());
        let mut request = deploy(WorkloadType::Elf, b"#!/bin/sh\nexec sleep 30\n".to_vec());
        request
            .environment
            .insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        let mut events = bus
            .subscribe(&subjects::events_wildcard("agentint"))
            .await
            .unwrap();

        let runner = ElfRunner::new(request, ctx);
        runner.start().await.unwrap();
        assert!(matches!(runner.start().await, Err(GuestError::AlreadyDeployed)));

        runner.stop().await.unwrap();
        assert!(events.try_next().is_none());
        // Second stop is a no-op.
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (_bus, ctx) = context(dir.path());
        let runner = ElfRunner::new(deploy(WorkloadType::Elf, Vec::new()), ctx);

        assert!(matches!(
            runner.execute("x", Vec::new()).await,
            Err(GuestError::UnsupportedOperation { .. })
        ));
    }
}
