use serde::{Deserialize, Serialize};

use crate::error::Stage;
use crate::model::{JobId, JobState, OperationType, VariantKey, VmId};

/// Structured event emitted while an operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DrillStarted {
        drill_id: uuid::Uuid,
        operation: OperationType,
        source_vms: Vec<VmId>,
    },
    PairBuilt {
        source_vm: VmId,
        destination_vm: VmId,
        variant: VariantKey,
    },
    PairPreValidated {
        source_vm: VmId,
    },
    JobTriggered {
        job_id: JobId,
        source_vms: Vec<VmId>,
    },
    JobFinished {
        job_id: JobId,
        state: JobState,
    },
    TraceFetched {
        source_vm: VmId,
        phases: usize,
    },
    PairValidated {
        source_vm: VmId,
    },
    CloneExpired {
        source_vm: VmId,
        clone: String,
    },
    PairFailed {
        source_vm: VmId,
        stage: Stage,
        error: String,
    },
    DrillCompleted {
        drill_id: uuid::Uuid,
        passed: usize,
        failed: usize,
    },
    DrillAborted {
        drill_id: uuid::Uuid,
        stage: Stage,
        error: String,
    },
}

impl Event {
    /// Pair the event is about, if any.
    pub fn source_vm(&self) -> Option<&str> {
        match self {
            Event::PairBuilt { source_vm, .. }
            | Event::PairPreValidated { source_vm }
            | Event::TraceFetched { source_vm, .. }
            | Event::PairValidated { source_vm }
            | Event::CloneExpired { source_vm, .. }
            | Event::PairFailed { source_vm, .. } => Some(source_vm),
            _ => None,
        }
    }

    /// Lifecycle stage the event belongs to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Event::PairBuilt { .. } => Some(Stage::Build),
            Event::PairPreValidated { .. } => Some(Stage::PreValidate),
            Event::JobTriggered { .. } | Event::JobFinished { .. } => Some(Stage::Trigger),
            Event::TraceFetched { .. } => Some(Stage::Trace),
            Event::PairValidated { .. } | Event::CloneExpired { .. } => Some(Stage::PostValidate),
            Event::PairFailed { stage, .. } | Event::DrillAborted { stage, .. } => Some(*stage),
            Event::DrillStarted { .. } | Event::DrillCompleted { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Event::PairFailed { .. } | Event::DrillAborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged_by_type() {
        let event = Event::PairFailed {
            source_vm: "vm1".into(),
            stage: Stage::PostValidate,
            error: "boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pair_failed");
        assert_eq!(value["stage"], "post_validate");
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert!(back.is_failure());
    }

    #[test]
    fn test_stage_and_pair_of_events() {
        let event = Event::TraceFetched {
            source_vm: "vm2".into(),
            phases: 4,
        };
        assert_eq!(event.source_vm(), Some("vm2"));
        assert_eq!(event.stage(), Some(Stage::Trace));
        let started = Event::DrillStarted {
            drill_id: uuid::Uuid::nil(),
            operation: OperationType::Failback,
            source_vms: vec![],
        };
        assert_eq!(started.source_vm(), None);
        assert_eq!(started.stage(), None);
    }
}
