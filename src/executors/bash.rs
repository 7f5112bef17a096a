//! Bash executor: runs the work's script as a local process.
//!
//! This is the blocking executor shape: the whole script runs inside one
//! tick, with a periodic check of the abort flag while the child is alive.
//! The launch is ledger-guarded, so a tick replayed after a crash cannot
//! start the script a second time.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;

use crate::engine::{StepLedger, WorkRunContext, STEP_EXECUTE};
use crate::error::{Error, Result};
use crate::storage::{InstanceStatus, SqliteStorage, WorkInstance};
use crate::workflow::WorkType;

use super::WorkExecutor;

/// How often the abort flag is checked while the child runs.
const ABORT_POLL: Duration = Duration::from_millis(100);

pub struct BashExecutor {
    storage: SqliteStorage,
    ledger: StepLedger,
}

impl BashExecutor {
    pub fn new(storage: SqliteStorage) -> Self {
        let ledger = StepLedger::new(storage.clone());
        Self { storage, ledger }
    }
}

#[async_trait]
impl WorkExecutor for BashExecutor {
    fn work_type(&self) -> WorkType {
        WorkType::Bash
    }

    async fn execute(
        &self,
        ctx: &WorkRunContext,
        instance: &mut WorkInstance,
        abort: Arc<AtomicBool>,
    ) -> Result<InstanceStatus> {
        let script = ctx
            .config
            .get("script")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if script.is_empty() {
            return Err(Error::Execution("Script is empty".into()));
        }

        if !self.ledger.advance_if_next(&ctx.event_id, STEP_EXECUTE).await? {
            // The launching tick died together with its child process;
            // there is nothing left to reattach to.
            return Err(Error::Execution(
                "Script process was lost before it finished".into(),
            ));
        }

        instance.append_log("Running script");
        self.storage.save_work_instance(instance).await?;

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        instance.pid = child.id();
        self.storage.save_work_instance(instance).await?;

        // Drain both pipes concurrently so a chatty script cannot block on
        // a full pipe before exiting.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut err) = stderr {
                let _ = err.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = sleep(ABORT_POLL) => {
                    if abort.load(Ordering::SeqCst) {
                        let _ = child.kill().await;
                        return Err(Error::Execution("Script was aborted".into()));
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            instance.result_data = Some(stdout);
            instance.append_log("Script finished with exit code 0");
            self.storage.save_work_instance(instance).await?;
            Ok(InstanceStatus::Success)
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            Err(Error::Execution(format!(
                "Script exited with code {}: {}",
                code,
                stderr.trim()
            )))
        }
    }

    async fn abort(&self, instance: &WorkInstance) -> Result<()> {
        if let Some(pid) = instance.pid {
            let _ = Command::new("kill").arg(pid.to_string()).status().await;
        }
        Ok(())
    }
}
