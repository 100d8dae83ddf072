//! Error taxonomy for DR operation validation.
//!
//! Every stage fails fast with one of these variants. `DrError::class()`
//! folds them into the four groups the CLI maps onto exit codes.

use std::fmt;

use thiserror::Error;

use crate::clone::CloneState;
use crate::model::{JobId, JobState, OperationType, PhaseName, VariantKey, VmId};
use crate::validate::Assertion;

pub type Result<T> = std::result::Result<T, DrError>;

#[derive(Debug, Error)]
pub enum DrError {
    /// The catalog has no entry for the operation and variant.
    #[error("no catalog entry for {op} on {key}")]
    MissingCatalogEntry { op: OperationType, key: VariantKey },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{op} is not supported for VM '{vm}': {reason}")]
    UnsupportedOperation {
        op: OperationType,
        vm: VmId,
        reason: String,
    },

    #[error("precondition violated for VM '{vm}': {reason}")]
    PreconditionViolation { vm: VmId, reason: String },

    #[error("phase {phase} not found in job trace for VM '{vm}'")]
    PhaseNotFound { vm: VmId, phase: PhaseName },

    #[error("phase {phase} for VM '{vm}' is malformed: {reason}")]
    TraceIntegrity {
        vm: VmId,
        phase: PhaseName,
        reason: String,
    },

    #[error("postcondition '{assertion}' failed for VM '{vm}': {reason}")]
    PostconditionViolation {
        vm: VmId,
        assertion: Assertion,
        reason: String,
    },

    #[error("job {job_id} finished in state '{state}'")]
    JobFailed { job_id: JobId, state: JobState },

    #[error("clone '{name}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        name: String,
        from: CloneState,
        to: CloneState,
    },

    #[error("external service error: {0}")]
    External(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Batch(#[from] BatchFailure),
}

/// Coarse grouping of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Unsupported,
    Validation,
    Operational,
}

impl DrError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DrError::MissingCatalogEntry { .. } | DrError::InvalidConfiguration(_) => {
                ErrorClass::Configuration
            }
            DrError::UnsupportedOperation { .. } => ErrorClass::Unsupported,
            DrError::PreconditionViolation { .. }
            | DrError::PhaseNotFound { .. }
            | DrError::TraceIntegrity { .. }
            | DrError::PostconditionViolation { .. }
            | DrError::InvalidTransition { .. } => ErrorClass::Validation,
            DrError::JobFailed { .. } | DrError::External(_) | DrError::Cancelled => {
                ErrorClass::Operational
            }
            // A batch is as severe as its worst member.
            DrError::Batch(batch) => batch
                .failures
                .iter()
                .map(|f| f.error.class())
                .max_by_key(|class| class.severity())
                .unwrap_or(ErrorClass::Operational),
        }
    }
}

impl ErrorClass {
    fn severity(&self) -> u8 {
        match self {
            ErrorClass::Validation => 0,
            ErrorClass::Operational => 1,
            ErrorClass::Unsupported => 2,
            ErrorClass::Configuration => 3,
        }
    }
}

/// Stage of the operation lifecycle at which a pair failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    PreValidate,
    Trigger,
    Trace,
    PostValidate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::PreValidate => "pre-validate",
            Stage::Trigger => "trigger",
            Stage::Trace => "trace",
            Stage::PostValidate => "post-validate",
        };
        f.write_str(name)
    }
}

/// One pair's failure inside an aggregated batch.
#[derive(Debug)]
pub struct PairFailure {
    pub source_vm: VmId,
    pub stage: Stage,
    pub error: DrError,
}

/// All per-pair failures of a batch run under the aggregate policy.
#[derive(Debug, Error)]
#[error("{} VM pair(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct BatchFailure {
    pub failures: Vec<PairFailure>,
}

fn summarize(failures: &[PairFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{} @ {}] {}", f.source_vm, f.stage, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by a role handle check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CheckFailure(pub String);

impl CheckFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of a single role handle check.
pub type CheckResult = std::result::Result<(), CheckFailure>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HypervisorKind;

    #[test]
    fn test_error_classes() {
        let missing = DrError::MissingCatalogEntry {
            op: OperationType::Failback,
            key: VariantKey::periodic(HypervisorKind::Vmware),
        };
        assert_eq!(missing.class(), ErrorClass::Configuration);

        let phase = DrError::PhaseNotFound {
            vm: "vm1".into(),
            phase: PhaseName::Replication,
        };
        assert_eq!(phase.class(), ErrorClass::Validation);
        assert_eq!(
            phase.to_string(),
            "phase REPLICATION not found in job trace for VM 'vm1'"
        );
    }

    #[test]
    fn test_batch_class_takes_most_severe_member() {
        let batch = BatchFailure {
            failures: vec![
                PairFailure {
                    source_vm: "vm1".into(),
                    stage: Stage::PostValidate,
                    error: DrError::PhaseNotFound {
                        vm: "vm1".into(),
                        phase: PhaseName::Backup,
                    },
                },
                PairFailure {
                    source_vm: "vm2".into(),
                    stage: Stage::Trace,
                    error: DrError::External("job service unreachable".into()),
                },
            ],
        };
        let err = DrError::from(batch);
        assert_eq!(err.class(), ErrorClass::Operational);
        assert!(err.to_string().starts_with("2 VM pair(s) failed"));
    }
}
