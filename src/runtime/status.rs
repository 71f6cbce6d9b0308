use crate::Event;

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Created; no turn has recorded a decision yet.
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }

    /// Pending, Running or Suspended.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Pending | OrchestrationStatus::Running | OrchestrationStatus::Suspended
        )
    }
}

impl From<&[Event]> for OrchestrationStatus {
    fn from(history: &[Event]) -> Self {
        if history.is_empty() {
            return OrchestrationStatus::NotFound;
        }
        for e in history.iter().rev() {
            match e {
                Event::OrchestrationCompleted { output } => {
                    return OrchestrationStatus::Completed { output: output.clone() };
                }
                Event::OrchestrationFailed { error } => return OrchestrationStatus::Failed { error: error.clone() },
                Event::OrchestrationTerminated { reason } => {
                    return OrchestrationStatus::Terminated { reason: reason.clone() };
                }
                _ => {}
            }
        }
        if is_suspended(history) {
            OrchestrationStatus::Suspended
        } else if history.len() == 1 {
            OrchestrationStatus::Pending
        } else {
            OrchestrationStatus::Running
        }
    }
}

/// True when the last suspend is not followed by a resume.
pub(crate) fn is_suspended(history: &[Event]) -> bool {
    let suspended = history
        .iter()
        .rposition(|e| matches!(e, Event::OrchestrationSuspended { .. }));
    let resumed = history.iter().rposition(|e| matches!(e, Event::OrchestrationResumed));
    match (suspended, resumed) {
        (Some(s), Some(r)) => s > r,
        (Some(_), None) => true,
        _ => false,
    }
}
