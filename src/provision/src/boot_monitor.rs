//! Waits for a freshly started VM to finish its first boot.
//!
//! The serial console is streamed from the compute node line by line. Every
//! line is kept for the audit log; the wait ends on the first line matching
//! the image's boot marker, on timeout, on cancellation or when the console
//! stream closes.

use crate::remote::{commands, RemoteExecutor, RemoteTarget};
use crate::provisioner::ProvisionError;
use regex::Regex;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct BootSettings {
    pub timeout: Duration,
    /// Interval of "still booting" log lines.
    pub heartbeat: Duration,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Result of one first-boot wait. The captured lines are returned whatever
/// the status so they can be persisted.
#[derive(Debug)]
pub struct BootOutcome {
    pub lines: Vec<String>,
    pub elapsed: Duration,
    /// The matching marker line on success.
    pub status: Result<String, ProvisionError>,
}

impl BootOutcome {
    pub fn log_text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }
}

pub struct BootMonitor {
    settings: BootSettings,
}

impl BootMonitor {
    pub fn new(settings: BootSettings) -> Self {
        Self { settings }
    }

    pub async fn await_first_boot(
        &self,
        executor: &dyn RemoteExecutor,
        target: RemoteTarget,
        console_path: &str,
        marker: &Regex,
        cancel: &CancellationToken,
    ) -> BootOutcome {
        let started = Instant::now();
        let mut lines = Vec::new();

        let command = commands::tail_serial_console(console_path);
        let mut stream = match executor.stream_lines(target, &command).await {
            Ok(stream) => stream,
            Err(e) => {
                return BootOutcome {
                    lines,
                    elapsed: started.elapsed(),
                    status: Err(e.into()),
                }
            }
        };

        tracing::info!(
            "[BootMonitor] Waiting for '{}' on {}:{} (timeout {}s)",
            marker.as_str(),
            target,
            console_path,
            self.settings.timeout.as_secs()
        );

        let deadline = tokio::time::sleep_until(started + self.settings.timeout);
        tokio::pin!(deadline);
        let mut heartbeat =
            tokio::time::interval_at(started + self.settings.heartbeat, self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!("[BootMonitor] Cancelled after {}s", started.elapsed().as_secs());
                    break Err(ProvisionError::Cancelled);
                }
                _ = &mut deadline => {
                    break Err(ProvisionError::BootTimeout {
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
                _ = heartbeat.tick() => {
                    tracing::info!(
                        "[BootMonitor] VM still booting. Elapsed: {}s, {} console lines",
                        started.elapsed().as_secs(),
                        lines.len()
                    );
                }
                next = stream.recv() => match next {
                    Some(Ok(line)) => {
                        let done = marker.is_match(&line);
                        lines.push(line);
                        if done {
                            break Ok(lines[lines.len() - 1].clone());
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(ProvisionError::ConsoleClosed),
                },
            }
        };

        // Dropping the stream stops the remote tail
        drop(stream);
        let elapsed = started.elapsed();

        match &status {
            Ok(_) => tracing::info!(
                "[BootMonitor] VM has completed first boot in {}s",
                elapsed.as_secs()
            ),
            Err(e) => tracing::warn!(
                "[BootMonitor] First boot not confirmed after {}s: {}",
                elapsed.as_secs(),
                e
            ),
        }

        BootOutcome {
            lines,
            elapsed,
            status,
        }
    }
}
