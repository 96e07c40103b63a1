//! Progress events of a provisioning run.

use crate::orchestrator::ProvisionState;
use serde::Serialize;
use std::time::Duration;

/// One progress event, as streamed to the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct ProvisionProgress {
    pub fqdn: String,
    pub percentage: u32,
    /// Set for events emitted while a state is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProvisionState>,
    pub message: String,
    /// Since the reporter was created, i.e. the start of the run.
    pub elapsed_ms: u64,
}

impl ProvisionProgress {
    pub fn new(fqdn: String, percentage: u32, message: String, elapsed: Duration) -> Self {
        Self {
            fqdn,
            percentage,
            state: None,
            message,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Tag the event with the state named `phase`; unknown names are ignored.
    pub fn in_phase(mut self, phase: Option<&str>) -> Self {
        self.state = phase.and_then(|name| {
            ProvisionState::ALL
                .iter()
                .copied()
                .find(|s| s.to_string() == name)
        });
        self
    }

    /// 1-based position of the current state and the number of states.
    pub fn step(&self) -> Option<(usize, usize)> {
        let state = self.state?;
        let index = ProvisionState::ALL.iter().position(|s| *s == state)?;
        Some((index + 1, ProvisionState::ALL.len()))
    }
}

impl std::fmt::Display for ProvisionProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>3}%] {:>6.1}s ", self.percentage, self.elapsed_ms as f64 / 1000.0)?;
        if let (Some((index, total)), Some(state)) = (self.step(), self.state) {
            write!(f, "{}/{} {}: ", index, total, state)?;
        }
        f.write_str(&self.message)
    }
}
