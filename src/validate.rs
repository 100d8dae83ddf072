//! Post-operation validation.
//!
//! A finished job is checked in two passes: its phase trace is matched
//! against the catalog entry for the pair's variant, then the pair's live
//! state is checked against the strategy's expectations through the role
//! handles. The first failed check ends validation of the pair.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::backend::RoleHandle;
use crate::catalog::{Catalog, CatalogEntry};
use crate::clone::CloneState;
use crate::error::{CheckResult, DrError, Result};
use crate::model::{JobId, OperationType, PhaseName, PhaseRecord, Side, VariantKey};
use crate::pairs::VmPair;
use crate::strategy::{OperationStrategy, PostExpectations};

/// A single named check run after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Assertion {
    BackupJob,
    ReplicationJob,
    BackupsSynced,
    PowerState,
    SyncStatus,
    FailoverStatus,
    Dvdf,
    WarmSync { cleanup: bool },
    Boot { side: Side },
    Hardware { side: Side, blobs: bool },
    Advanced { side: Side },
    TestData { side: Side },
    NoTestData { side: Side },
    CloneExpired,
}

impl Assertion {
    pub fn name(&self) -> &'static str {
        match self {
            Assertion::BackupJob => "backup_job",
            Assertion::ReplicationJob => "replication_job",
            Assertion::BackupsSynced => "backups_synced",
            Assertion::PowerState => "power_state",
            Assertion::SyncStatus => "sync_status",
            Assertion::FailoverStatus => "failover_status",
            Assertion::Dvdf => "dvdf",
            Assertion::WarmSync { .. } => "warm_sync",
            Assertion::Boot { .. } => "boot",
            Assertion::Hardware { .. } => "hardware",
            Assertion::Advanced { .. } => "advanced",
            Assertion::TestData { .. } => "test_data",
            Assertion::NoTestData { .. } => "no_test_data",
            Assertion::CloneExpired => "clone_expired",
        }
    }

    fn side(&self) -> Option<Side> {
        match self {
            Assertion::Boot { side }
            | Assertion::Hardware { side, .. }
            | Assertion::Advanced { side }
            | Assertion::TestData { side }
            | Assertion::NoTestData { side } => Some(*side),
            _ => None,
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side() {
            Some(side) => write!(f, "{}({side})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// What post-validation checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PostMode {
    /// Trace and state checks after the operation job.
    #[default]
    Normal,
    /// Test Failover clone teardown only.
    Expiration,
}

#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    pub mode: PostMode,
    /// Operation job, required when the backup sync check is planned.
    pub job_id: Option<JobId>,
    pub full_replication: bool,
    /// Whether the job kept storage blobs; `None` when it was not queried.
    pub blobs_retained: Option<bool>,
}

/// A catalog phase found in a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPhase {
    pub phase: PhaseName,
    /// Sub-job id, only for phases that run a job of their own.
    pub sub_job: Option<String>,
}

/// Match every phase expected by `entry` against the trace of `vm`.
///
/// Source, destination, and clone phases are matched against the same
/// per-VM trace. A phase that runs a sub-job must appear with exactly one
/// non-empty sub-job id.
pub fn match_phases(
    vm: &str,
    entry: &CatalogEntry,
    trace: &[PhaseRecord],
) -> Result<Vec<MatchedPhase>> {
    let expected: BTreeSet<PhaseName> = entry
        .source
        .iter()
        .chain(&entry.destination)
        .chain(&entry.clone)
        .copied()
        .collect();

    let mut matched = Vec::with_capacity(expected.len());
    for phase in expected {
        let records: Vec<&PhaseRecord> = trace.iter().filter(|r| r.phase == phase).collect();
        if records.is_empty() {
            return Err(DrError::PhaseNotFound {
                vm: vm.to_string(),
                phase,
            });
        }
        let sub_job = if phase.carries_job() {
            let ids: Vec<&str> = records.iter().filter_map(|r| r.sub_job()).collect();
            match ids.as_slice() {
                [id] => Some(id.to_string()),
                [] => {
                    return Err(DrError::TraceIntegrity {
                        vm: vm.to_string(),
                        phase,
                        reason: "no sub-job id recorded".into(),
                    });
                }
                _ => {
                    return Err(DrError::TraceIntegrity {
                        vm: vm.to_string(),
                        phase,
                        reason: format!("{} records carry a sub-job id", ids.len()),
                    });
                }
            }
        } else {
            None
        };
        matched.push(MatchedPhase { phase, sub_job });
    }
    Ok(matched)
}

/// Ordered state checks for a pair of variant `key`.
pub fn plan_assertions(
    expectations: &PostExpectations,
    key: &VariantKey,
    mode: PostMode,
) -> Vec<Assertion> {
    if mode == PostMode::Expiration {
        return vec![Assertion::CloneExpired];
    }
    let mut plan = Vec::new();
    // continuous replication ships a journal, not backup jobs
    if expectations.backups_synced && !key.continuous {
        plan.push(Assertion::BackupsSynced);
    }
    plan.extend([
        Assertion::PowerState,
        Assertion::SyncStatus,
        Assertion::FailoverStatus,
    ]);
    if key.dvdf {
        plan.push(Assertion::Dvdf);
    }
    if key.warm_sync {
        plan.push(Assertion::WarmSync {
            cleanup: expectations.warm_sync_cleanup,
        });
    }
    if let Some(side) = expectations.boot {
        plan.push(Assertion::Boot { side });
    }
    if let Some(side) = expectations.hardware {
        plan.push(Assertion::Hardware {
            side,
            blobs: expectations.blobs_retained,
        });
    }
    if let Some(side) = expectations.advanced {
        plan.push(Assertion::Advanced { side });
    }
    if let Some(data) = expectations.test_data {
        plan.push(if data.present {
            Assertion::TestData { side: data.side }
        } else {
            Assertion::NoTestData { side: data.side }
        });
    }
    plan
}

/// Validate a pair after its job finished.
///
/// `trace` is the per-VM phase trace of the job; it is ignored for
/// continuous pairs and in expiration mode.
pub fn post_validate(
    pair: &mut VmPair,
    trace: &[PhaseRecord],
    catalog: &Catalog,
    strategy: &dyn OperationStrategy,
    options: &PostOptions,
) -> Result<()> {
    let op = strategy.operation();
    if options.mode == PostMode::Expiration {
        return validate_expiration(pair, op);
    }

    let entry = catalog.entry(op, &pair.variant)?;
    if pair.variant.continuous {
        tracing::debug!(source = %pair.source_vm, "continuous pair, skipping phase matching");
    } else {
        let matched = match_phases(&pair.source_vm, entry, trace)?;
        validate_sub_jobs(pair, &matched, options.full_replication)?;
    }
    if let Some(clone) = pair.clone.as_mut() {
        clone.reset();
        clone.transition(CloneState::CloneCreated)?;
    }

    pair.refresh()?;
    let expectations = strategy.expectations(&pair.variant);
    for assertion in plan_assertions(&expectations, &pair.variant, PostMode::Normal) {
        run_assertion(pair, assertion, &expectations, options)?;
        if let (Assertion::Boot { .. }, Some(clone)) = (assertion, pair.clone.as_mut()) {
            clone.transition(CloneState::Booted)?;
        }
    }
    if let Some(clone) = pair.clone.as_mut() {
        clone.transition(CloneState::Validated)?;
    }
    tracing::info!(source = %pair.source_vm, operation = %op, "post-validation passed");
    Ok(())
}

fn validate_sub_jobs(pair: &VmPair, matched: &[MatchedPhase], full_replication: bool) -> Result<()> {
    let handle = pair.job_handle()?;
    for m in matched {
        let Some(job) = m.sub_job.as_deref() else {
            continue;
        };
        let (assertion, result) = match m.phase {
            PhaseName::Backup => (Assertion::BackupJob, handle.validate_backup_job(job)),
            PhaseName::Replication => (
                Assertion::ReplicationJob,
                handle.validate_replication_job(job, full_replication),
            ),
            _ => continue,
        };
        violation(&pair.source_vm, assertion, result)?;
        tracing::debug!(source = %pair.source_vm, phase = %m.phase, job, "sub-job validated");
    }
    Ok(())
}

fn run_assertion(
    pair: &VmPair,
    assertion: Assertion,
    expectations: &PostExpectations,
    options: &PostOptions,
) -> Result<()> {
    let handle: &dyn RoleHandle = pair.primary()?;
    let result = match assertion {
        Assertion::BackupJob | Assertion::ReplicationJob => Ok(()),
        Assertion::BackupsSynced => {
            let job = options.job_id.as_deref().ok_or_else(|| {
                DrError::InvalidConfiguration(format!(
                    "backup sync check for '{}' needs the operation job id",
                    pair.source_vm
                ))
            })?;
            pair.job_handle()?.validate_backups_synced(job)
        }
        Assertion::PowerState => handle.validate_power_state(expectations.power),
        Assertion::SyncStatus => handle.validate_sync_status(expectations.sync),
        Assertion::FailoverStatus => handle.validate_failover_status(expectations.failover),
        Assertion::Dvdf => handle.validate_dvdf(),
        Assertion::WarmSync { cleanup } => handle.validate_warm_sync(cleanup),
        Assertion::Boot { side } => handle.validate_boot(side.is_source()),
        Assertion::Hardware { side, blobs } => {
            handle.validate_hardware(side.is_source(), options.blobs_retained.filter(|_| blobs))
        }
        Assertion::Advanced { side } => handle.validate_advanced(side.is_source()),
        Assertion::TestData { side } => handle.validate_test_data(side.is_source()),
        Assertion::NoTestData { side } => handle.validate_no_test_data(side.is_source()),
        Assertion::CloneExpired => handle.validate_clone_expired(),
    };
    violation(&pair.source_vm, assertion, result)?;
    tracing::debug!(source = %pair.source_vm, check = %assertion, "check passed");
    Ok(())
}

fn validate_expiration(pair: &mut VmPair, op: OperationType) -> Result<()> {
    if op != OperationType::TestFailover {
        return Err(DrError::InvalidConfiguration(format!(
            "clone expiration only applies to {}, not {op}",
            OperationType::TestFailover
        )));
    }
    let source_vm = pair.source_vm.clone();
    if pair.clone.is_none() {
        return Err(DrError::InvalidConfiguration(format!(
            "pair '{source_vm}' tracks no clone"
        )));
    }

    pair.refresh()?;
    let primary = pair.primary()?;
    violation(
        &source_vm,
        Assertion::CloneExpired,
        primary.validate_clone_expired(),
    )?;
    let reported = primary.clone_vm();

    let Some(clone) = pair.clone.as_mut() else {
        return Ok(());
    };
    match reported {
        Some(reported) if reported.state() == CloneState::NotStarted => {
            return Err(DrError::PostconditionViolation {
                vm: source_vm,
                assertion: Assertion::CloneExpired,
                reason: format!("clone '{}' was never created", reported.name),
            });
        }
        Some(_) => clone.transition(CloneState::Expired)?,
        // the clone is gone, so the handle no longer reports it
        None => clone.mark_expired(),
    }
    tracing::info!(source = %source_vm, clone = %clone.name, "clone expired");
    Ok(())
}

fn violation(vm: &str, assertion: Assertion, result: CheckResult) -> Result<()> {
    result.map_err(|failure| DrError::PostconditionViolation {
        vm: vm.to_string(),
        assertion,
        reason: failure.0,
    })
}
