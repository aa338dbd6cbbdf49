use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::db::TaskExecParams;

/// Result of one task's process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecResult {
    pub pid: Option<u32>,
    pub ret_code: Option<i32>,
    /// Set when the process was terminated by a signal
    pub signal: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Spawn or wait failure
    pub error: Option<String>,
    pub success: bool,
}

impl TaskExecResult {
    fn spawn_failed(error: String) -> Self {
        Self {
            pid: None,
            ret_code: None,
            signal: None,
            stdout: None,
            stderr: None,
            error: Some(error),
            success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunnerEvent {
    /// The process is up
    Started(u32),
    /// The process is gone. Always the last event.
    Finished(TaskExecResult),
}

/// Runs a single task as an `sh -c` child process.
///
/// Commands run directly through the shell, without sandboxing. The runner
/// reports `Started(pid)` once the process exists and `Finished(result)`
/// exactly once, also when the process could not be spawned.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    params: TaskExecParams,
}

impl TaskRunner {
    pub fn new(params: TaskExecParams) -> Self {
        Self { params }
    }

    /// Start the task in the background and return its event stream
    pub fn run(self) -> mpsc::UnboundedReceiver<TaskRunnerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let result = self.execute(&tx).await;
            let _ = tx.send(TaskRunnerEvent::Finished(result));
        });
        rx
    }

    async fn execute(&self, tx: &mpsc::UnboundedSender<TaskRunnerEvent>) -> TaskExecResult {
        let job_id = self.params.job_id;
        let task_id = self.params.task_id;
        tracing::info!(job_id = %job_id, task_id, cmd = %self.params.cmd, "Starting task");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.params.cmd)
            .envs(self.params.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.params.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, task_id, error = %e, "Task spawn failed");
                return TaskExecResult::spawn_failed(e.to_string());
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            let _ = tx.send(TaskRunnerEvent::Started(pid));
        }

        if let (Some(input), Some(mut stdin)) = (self.params.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "Task closed stdin early");
                }
            });
        }

        let result = Self::process_output(pid, child.wait_with_output().await);
        tracing::info!(
            job_id = %job_id,
            task_id,
            success = result.success,
            ret_code = ?result.ret_code,
            signal = ?result.signal,
            "Task finished"
        );
        result
    }

    fn process_output(
        pid: Option<u32>,
        result: Result<std::process::Output, std::io::Error>,
    ) -> TaskExecResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                TaskExecResult {
                    pid,
                    ret_code: output.status.code(),
                    signal: output.status.signal(),
                    stdout: (!stdout.is_empty()).then_some(stdout),
                    stderr: (!stderr.is_empty()).then_some(stderr),
                    error: None,
                    success: output.status.success(),
                }
            }
            Err(e) => TaskExecResult {
                pid,
                error: Some(e.to_string()),
                ..TaskExecResult::spawn_failed(String::new())
            },
        }
    }
}
