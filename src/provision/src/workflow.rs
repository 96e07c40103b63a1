//! Sequential executor for remote tasks.
//!
//! Runs a list of RemoteTasks against the cluster nodes with progress
//! reporting, stopping at the first failure.

use crate::orchestrator::CompensatableAction;
use crate::provisioner::ProvisionError;
use crate::remote::{CommandOutput, RemoteError, RemoteExecutor};
use crate::tasks::RemoteTask;

/// Execution context for remote tasks.
pub struct TaskExecutor<'a> {
    pub remote: &'a dyn RemoteExecutor,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(remote: &'a dyn RemoteExecutor) -> Self {
        Self { remote }
    }

    /// Execute a single task, bounded by its timeout
    pub async fn execute(&self, task: &RemoteTask) -> Result<CommandOutput, RemoteError> {
        tracing::info!("[TaskExecutor] Executing task '{}'", task.display_name());
        tracing::debug!("[TaskExecutor] {}> {}", task.target, task.command);

        let output = tokio::time::timeout(task.timeout, self.remote.run(task.target, &task.command))
            .await
            .map_err(|_| RemoteError::Timeout {
                target: task.target,
                command: task.command.clone(),
                secs: task.timeout.as_secs(),
            })??;

        if output.success() {
            tracing::debug!("[TaskExecutor] Task '{}' completed successfully", task.name);
        } else {
            tracing::error!(
                "[TaskExecutor] Task '{}' failed (exit {}): {}",
                task.name,
                output.exit_code,
                output.last_error_line(),
            );
        }
        Ok(output)
    }
}

/// Execute a sequence of remote tasks with progress tracking.
/// Fail-fast: stops on the first task failure. Side effects of completed
/// tasks are pushed onto `ledger`; the side effect of the failing task is
/// pushed as unconfirmed, since the command may have got partway.
pub async fn run_tasks<F>(
    tasks: &[RemoteTask],
    executor: &TaskExecutor<'_>,
    ledger: &mut Vec<CompensatableAction>,
    progress_start: u32,
    progress_end: u32,
    progress_fn: F,
) -> Result<(), ProvisionError>
where
    F: Fn(u32, &str),
{
    if tasks.is_empty() {
        return Ok(());
    }

    let total_tasks = tasks.len() as u32;
    let span = progress_end.saturating_sub(progress_start);

    for (index, task) in tasks.iter().enumerate() {
        let progress = progress_start + span.saturating_mul(index as u32) / total_tasks;
        let display_name = task.display_name();

        progress_fn(progress, &format!("Executing {}", display_name));

        let task_start = std::time::Instant::now();
        let result = executor.execute(task).await;
        let task_duration = task_start.elapsed();

        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(RemoteError::CommandFailed {
                target: task.target,
                command: task.command.clone(),
                exit_code: output.exit_code,
                stderr: output.last_error_line(),
            }),
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            tracing::warn!(
                "[TIMING] Task {} failed after {}ms",
                display_name,
                task_duration.as_millis()
            );
            if let Some(action) = &task.leaves {
                tracing::warn!(
                    "[TaskExecutor] '{}' may have left {} behind",
                    task.name,
                    action
                );
                ledger.push(action.clone().unconfirmed());
            }
            return Err(ProvisionError::Remote(e));
        }

        if let Some(action) = &task.leaves {
            ledger.push(action.clone());
        }

        tracing::info!(
            "[TIMING] Task {} completed in {}ms",
            display_name,
            task_duration.as_millis()
        );

        let completion_progress = if index + 1 < tasks.len() {
            progress_start + span.saturating_mul((index + 1) as u32) / total_tasks
        } else {
            progress_end
        };
        progress_fn(completion_progress, &format!("Completed {}", display_name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{LineStream, RemoteTarget};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Exits 1 for any command containing "false", otherwise succeeds.
    #[derive(Default)]
    struct ScriptedRemote {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedRemote {
        async fn run(&self, _: RemoteTarget, command: &str) -> Result<CommandOutput, RemoteError> {
            self.ran.lock().unwrap().push(command.to_string());
            if command.contains("false") {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "rbd: image exists\n".to_string(),
                });
            }
            if command.contains("sleep") {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(CommandOutput::default())
        }

        async fn write_file(&self, _: RemoteTarget, _: &str, _: &[u8]) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn read_file(&self, _: RemoteTarget, _: &str) -> Result<Vec<u8>, RemoteError> {
            Ok(Vec::new())
        }

        async fn file_exists(&self, _: RemoteTarget, _: &str) -> Result<bool, RemoteError> {
            Ok(true)
        }

        async fn remove_file(&self, _: RemoteTarget, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn stream_lines(&self, target: RemoteTarget, _: &str) -> Result<LineStream, RemoteError> {
            Err(RemoteError::NotConfigured(target))
        }
    }

    fn disk(name: &str) -> CompensatableAction {
        CompensatableAction::DiskCreated {
            pool: "ssd".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_keeps_completed_side_effects() {
        let remote = ScriptedRemote::default();
        let executor = TaskExecutor::new(&remote);
        let tasks = vec![
            RemoteTask::new("Create swap disk", RemoteTarget::Compute, "true swap")
                .leaving(disk("vm-1-disk-0")),
            RemoteTask::new("Create EFI disk", RemoteTarget::Compute, "false efi")
                .leaving(disk("vm-1-efivars")),
            RemoteTask::new("Never runs", RemoteTarget::Compute, "true"),
        ];
        let mut ledger = Vec::new();
        let seen = Mutex::new(Vec::new());

        let err = run_tasks(&tasks, &executor, &mut ledger, 20, 30, |pct, _| {
            seen.lock().unwrap().push(pct)
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("exited with 1"));
        assert!(err.to_string().contains("rbd: image exists"));
        assert_eq!(
            ledger,
            vec![disk("vm-1-disk-0"), disk("vm-1-efivars").unconfirmed()]
        );
        assert_eq!(remote.ran.lock().unwrap().len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![20, 23, 23]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout() {
        let remote = ScriptedRemote::default();
        let executor = TaskExecutor::new(&remote);
        let tasks = vec![RemoteTask::new("Import base image", RemoteTarget::Compute, "sleep")
            .with_timeout(Duration::from_secs(5))
            .leaving(disk("vm-1-disk-1"))];
        let mut ledger = Vec::new();

        let err = run_tasks(&tasks, &executor, &mut ledger, 40, 55, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Remote(RemoteError::Timeout { secs: 5, .. })
        ));
        assert_eq!(ledger, vec![disk("vm-1-disk-1").unconfirmed()]);
        assert_eq!(
            ledger[0].to_string(),
            "possibly disk ssd/vm-1-disk-1 (rbd -p ssd rm vm-1-disk-1)"
        );
    }
}
