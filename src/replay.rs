//! Recorded environment for offline drills.
//!
//! A recording captures what the DR services reported for one operation:
//! the replication group, each pair's state before and after the job, and
//! the job's outcome and phase trace. `ReplayBackend` answers every
//! collaborator call from it, so a drill can be re-validated without a
//! live environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::backend::{
    InstanceService, JobService, OperationContext, ReplicationAssociation, RoleHandle,
};
use crate::clone::CloneVm;
use crate::error::{CheckFailure, CheckResult, DrError, Result};
use crate::model::{
    FailoverStatus, JobId, JobState, OperationType, PairStatus, PhaseRecord, PowerState, RoleName,
    Side, SyncStatus, VmId,
};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Recording {
    /// Source instance kind, e.g. "vmware".
    #[serde(default = "default_kind")]
    pub source_kind: String,
    /// Destination instance kind, e.g. "Azure Resource Manager".
    pub destination_kind: String,
    pub pairs: Vec<RecordedPair>,
    pub job: RecordedJob,
}

fn default_kind() -> String {
    "vmware".to_string()
}

fn default_true() -> bool {
    true
}

/// One pair as observed before and after the job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordedPair {
    #[serde(flatten)]
    pub association: ReplicationAssociation,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub warm_sync: bool,
    #[serde(default)]
    pub dvdf: bool,
    #[serde(default = "default_true")]
    pub supports_failback: bool,
    #[serde(default)]
    pub reverse_schedule: bool,
    pub before: PairStatus,
    pub after: PairStatus,
    /// Power state after the job; unrecorded sides are not checked.
    #[serde(default)]
    pub power_after: Option<PowerState>,
    /// Sides holding the seeded test data after the job.
    #[serde(default)]
    pub test_data_after: BTreeSet<Side>,
    /// Names of checks that failed in the recorded environment,
    /// e.g. "boot", "hardware", "replication_job".
    #[serde(default)]
    pub failing_checks: BTreeSet<String>,
    /// Test Failover clone, if one was observed.
    #[serde(default)]
    pub clone: Option<CloneVm>,
    #[serde(default)]
    pub clone_expired: bool,
    /// Backups pending to sync when the job started, in the order they ran.
    #[serde(default)]
    pub backups_to_sync: Vec<RecordedBackup>,
    /// Last backup job the replication had synced once the job finished.
    #[serde(default)]
    pub last_synced_backup: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordedBackup {
    pub job_id: JobId,
    pub level: BackupLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackupLevel {
    Full,
    Incremental,
    Differential,
    SyntheticFull,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordedJob {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(default)]
    pub blobs_retained: bool,
    #[serde(default)]
    pub phases: BTreeMap<VmId, Vec<PhaseRecord>>,
}

/// Generate JSON Schema for recordings.
pub fn generate_schema() -> String {
    let schema = schemars::schema_for!(Recording);
    serde_json::to_string_pretty(&schema).expect("failed to serialize schema")
}

pub fn load_recording(path: &Path) -> anyhow::Result<Recording> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open recording {}", path.display()))?;
    let recording = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("invalid recording {}", path.display()))?;
    Ok(recording)
}

struct RecordedInstance {
    kind: String,
    failback: BTreeMap<VmId, bool>,
}

impl InstanceService for RecordedInstance {
    fn instance_kind(&self) -> Result<String> {
        Ok(self.kind.clone())
    }

    fn supports_failback(&self, vm: &str) -> Result<bool> {
        Ok(self.failback.get(vm).copied().unwrap_or(true))
    }
}

/// Serves a `Recording` as context, job service, and role handles.
pub struct ReplayBackend {
    recording: Recording,
    source: RecordedInstance,
    destination: RecordedInstance,
    /// Set once the job was waited on; handles then report `after` state.
    finished: Arc<AtomicBool>,
}

impl ReplayBackend {
    pub fn new(recording: Recording) -> Self {
        let failback = recording
            .pairs
            .iter()
            .map(|p| (p.association.source_vm.clone(), p.supports_failback))
            .collect();
        Self {
            source: RecordedInstance {
                kind: recording.source_kind.clone(),
                failback,
            },
            destination: RecordedInstance {
                kind: recording.destination_kind.clone(),
                failback: BTreeMap::new(),
            },
            recording,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    fn pair(&self, source_vm: &str) -> Result<&RecordedPair> {
        self.recording
            .pairs
            .iter()
            .find(|p| p.association.source_vm == source_vm)
            .ok_or_else(|| {
                DrError::InvalidConfiguration(format!(
                    "VM '{source_vm}' is not part of the recorded replication group"
                ))
            })
    }

    fn job(&self, job: &str) -> Result<&RecordedJob> {
        if self.recording.job.job_id != job {
            return Err(DrError::External(format!("unknown job {job}")));
        }
        Ok(&self.recording.job)
    }
}

impl OperationContext for ReplayBackend {
    fn association(&self, source_vm: &str) -> Result<ReplicationAssociation> {
        Ok(self.pair(source_vm)?.association.clone())
    }

    fn source_instance(&self) -> &dyn InstanceService {
        &self.source
    }

    fn destination_instance(&self) -> &dyn InstanceService {
        &self.destination
    }

    fn role_handle(
        &self,
        role: RoleName,
        association: &ReplicationAssociation,
    ) -> Result<Box<dyn RoleHandle>> {
        let pair = self.pair(&association.source_vm)?.clone();
        Ok(Box::new(ReplayHandle {
            role,
            status: pair.before,
            pair,
            finished: Arc::clone(&self.finished),
        }))
    }
}

impl JobService for ReplayBackend {
    fn trigger(&self, op: OperationType, source_vms: &[VmId]) -> Result<JobId> {
        tracing::info!(operation = %op, vms = source_vms.len(), job = %self.recording.job.job_id, "replaying job");
        Ok(self.recording.job.job_id.clone())
    }

    fn wait(&self, job: &str) -> Result<JobState> {
        let state = self.job(job)?.state;
        self.finished.store(true, Ordering::SeqCst);
        Ok(state)
    }

    fn phases(&self, job: &str) -> Result<BTreeMap<VmId, Vec<PhaseRecord>>> {
        Ok(self.job(job)?.phases.clone())
    }

    fn blobs_retained(&self, job: &str) -> Result<bool> {
        Ok(self.job(job)?.blobs_retained)
    }
}

struct ReplayHandle {
    role: RoleName,
    pair: RecordedPair,
    status: PairStatus,
    finished: Arc<AtomicBool>,
}

impl ReplayHandle {
    fn recorded(&self, check: &str) -> CheckResult {
        if self.pair.failing_checks.contains(check) {
            return Err(CheckFailure::new(format!(
                "{check} check failed for '{}'",
                self.pair.association.source_vm
            )));
        }
        Ok(())
    }
}

fn side(source: bool) -> Side {
    if source {
        Side::Source
    } else {
        Side::Destination
    }
}

impl RoleHandle for ReplayHandle {
    fn role(&self) -> RoleName {
        self.role
    }

    fn refresh(&mut self) -> Result<()> {
        self.status = if self.finished.load(Ordering::SeqCst) {
            self.pair.after
        } else {
            self.pair.before
        };
        Ok(())
    }

    fn is_continuous(&self) -> bool {
        self.pair.continuous
    }

    fn is_warm_sync_enabled(&self) -> bool {
        self.pair.warm_sync
    }

    fn is_dvdf_enabled(&self) -> bool {
        self.pair.dvdf
    }

    fn status(&self) -> PairStatus {
        self.status
    }

    fn has_reverse_schedule(&self) -> Result<bool> {
        Ok(self.pair.reverse_schedule)
    }

    fn clone_vm(&self) -> Option<CloneVm> {
        self.pair.clone.clone()
    }

    fn validate_backup_job(&self, job: &str) -> CheckResult {
        tracing::debug!(job, "backup sub-job");
        self.recorded("backup_job")
    }

    fn validate_replication_job(&self, job: &str, full_replication: bool) -> CheckResult {
        tracing::debug!(job, full_replication, "replication sub-job");
        self.recorded("replication_job")
    }

    fn validate_backups_synced(&self, job: &str) -> CheckResult {
        self.recorded("backups_synced")?;
        let Some(latest) = self.pair.backups_to_sync.last() else {
            return Ok(());
        };
        if self.pair.last_synced_backup.as_deref() != Some(latest.job_id.as_str()) {
            return Err(CheckFailure::new(format!(
                "backup {} pending before job {job} was not replicated, last synced is {}",
                latest.job_id,
                self.pair.last_synced_backup.as_deref().unwrap_or("none")
            )));
        }
        if let Some(backup) = self
            .pair
            .backups_to_sync
            .iter()
            .find(|b| b.level != BackupLevel::Incremental)
        {
            return Err(CheckFailure::new(format!(
                "pending backup {} is {:?}, expected incremental",
                backup.job_id, backup.level
            )));
        }
        Ok(())
    }

    fn validate_power_state(&self, expected: PowerState) -> CheckResult {
        self.recorded("power_state")?;
        let Some(actual) = self.pair.power_after else {
            return Ok(());
        };
        let sides = [
            (Side::Source, expected.source, actual.source),
            (Side::Destination, expected.destination, actual.destination),
        ];
        for (side, want, got) in sides {
            if let (Some(want), Some(got)) = (want, got)
                && want != got
            {
                return Err(CheckFailure::new(format!(
                    "{side} VM is {got:?}, expected {want:?}"
                )));
            }
        }
        Ok(())
    }

    fn validate_sync_status(&self, expected: SyncStatus) -> CheckResult {
        self.recorded("sync_status")?;
        if self.status.sync != expected {
            return Err(CheckFailure::new(format!(
                "sync status is {:?}, expected {expected:?}",
                self.status.sync
            )));
        }
        Ok(())
    }

    fn validate_failover_status(&self, allowed: &[FailoverStatus]) -> CheckResult {
        self.recorded("failover_status")?;
        if !allowed.contains(&self.status.failover) {
            return Err(CheckFailure::new(format!(
                "failover status is {:?}, expected one of {allowed:?}",
                self.status.failover
            )));
        }
        Ok(())
    }

    fn validate_dvdf(&self) -> CheckResult {
        self.recorded("dvdf")
    }

    fn validate_warm_sync(&self, _cleanup: bool) -> CheckResult {
        self.recorded("warm_sync")
    }

    fn validate_boot(&self, _source: bool) -> CheckResult {
        self.recorded("boot")
    }

    fn validate_hardware(&self, _source: bool, _blobs_retained: Option<bool>) -> CheckResult {
        self.recorded("hardware")
    }

    fn validate_advanced(&self, _source: bool) -> CheckResult {
        self.recorded("advanced")
    }

    fn validate_test_data(&self, source: bool) -> CheckResult {
        self.recorded("test_data")?;
        let side = side(source);
        if !self.pair.test_data_after.contains(&side) {
            return Err(CheckFailure::new(format!("test data missing on {side}")));
        }
        Ok(())
    }

    fn validate_no_test_data(&self, source: bool) -> CheckResult {
        self.recorded("no_test_data")?;
        let side = side(source);
        if self.pair.test_data_after.contains(&side) {
            return Err(CheckFailure::new(format!("test data still present on {side}")));
        }
        Ok(())
    }

    fn add_test_data(&mut self, source: bool) -> Result<()> {
        // the recording already holds where the data ended up
        tracing::debug!(source = %self.pair.association.source_vm, side = %side(source), "seeding test data");
        Ok(())
    }

    fn validate_clone_expired(&self) -> CheckResult {
        self.recorded("clone_expired")?;
        if !self.pair.clone_expired {
            let name = self
                .pair
                .clone
                .as_ref()
                .map(|c| c.name.as_str())
                .unwrap_or("clone");
            return Err(CheckFailure::new(format!("'{name}' still exists")));
        }
        Ok(())
    }
}
