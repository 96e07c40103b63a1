//! RemoteTask: one shell command on a cluster node

use crate::orchestrator::CompensatableAction;
use crate::remote::RemoteTarget;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub name: String,
    pub target: RemoteTarget,
    pub command: String,
    pub timeout: Duration,
    /// Remote state left behind once the command succeeded.
    pub leaves: Option<CompensatableAction>,
}

impl RemoteTask {
    pub fn new(name: impl Into<String>, target: RemoteTarget, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target,
            command: command.into(),
            timeout: Duration::from_secs(120),
            leaves: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn leaving(mut self, action: CompensatableAction) -> Self {
        self.leaves = Some(action);
        self
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_naming() {
        let task = RemoteTask::new("Create swap disk", RemoteTarget::Compute, "rbd ...")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(task.display_name(), "Create swap disk (compute)");
        assert_eq!(task.timeout, Duration::from_secs(5));
        assert!(task.leaves.is_none());
    }
}
