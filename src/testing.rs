//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    InstanceService, JobService, OperationContext, ReplicationAssociation, RoleHandle,
};
use crate::catalog::CatalogEntry;
use crate::clone::CloneVm;
use crate::error::{CheckFailure, CheckResult, DrError, Result};
use crate::model::{
    FailoverStatus, JobId, JobState, OperationType, PairStatus, PhaseRecord, PowerState, RoleName,
    SyncStatus, VmId,
};
use crate::settle::Settle;

/// Shared log of every role handle call, in call order.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Whether any call's method name equals `method`.
    pub fn called(&self, method: &str) -> bool {
        self.calls()
            .iter()
            .any(|c| c.split(':').nth(1).is_some_and(|m| m.starts_with(method)))
    }
}

#[derive(Clone)]
pub struct MockHandle {
    pub role: RoleName,
    pub continuous: bool,
    pub warm_sync: bool,
    pub dvdf: bool,
    pub status: PairStatus,
    pub reverse_schedule: bool,
    pub clone: Option<CloneVm>,
    pub failing: BTreeSet<String>,
    pub log: CallLog,
}

impl Default for MockHandle {
    fn default() -> Self {
        Self {
            role: RoleName::Failover,
            continuous: false,
            warm_sync: false,
            dvdf: false,
            status: PairStatus {
                sync: SyncStatus::InSync,
                failover: FailoverStatus::None,
            },
            reverse_schedule: false,
            clone: None,
            failing: BTreeSet::new(),
            log: CallLog::default(),
        }
    }
}

impl MockHandle {
    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    pub fn warm_sync(mut self) -> Self {
        self.warm_sync = true;
        self
    }

    pub fn dvdf(mut self) -> Self {
        self.dvdf = true;
        self
    }

    pub fn with_status(mut self, sync: SyncStatus, failover: FailoverStatus) -> Self {
        self.status = PairStatus { sync, failover };
        self
    }

    pub fn with_reverse_schedule(mut self) -> Self {
        self.reverse_schedule = true;
        self
    }

    pub fn with_clone(mut self, clone: CloneVm) -> Self {
        self.clone = Some(clone);
        self
    }

    pub fn failing(mut self, check: &str) -> Self {
        self.failing.insert(check.to_string());
        self
    }

    fn check(&self, call: &str) -> CheckResult {
        self.log.push(format!("{}:{call}", self.role));
        let name = call.split('(').next().unwrap_or(call);
        if self.failing.contains(name) {
            return Err(CheckFailure::new(format!("{name} check failed")));
        }
        Ok(())
    }
}

impl RoleHandle for MockHandle {
    fn role(&self) -> RoleName {
        self.role
    }

    fn refresh(&mut self) -> Result<()> {
        self.log.push(format!("{}:refresh", self.role));
        Ok(())
    }

    fn is_continuous(&self) -> bool {
        self.continuous
    }

    fn is_warm_sync_enabled(&self) -> bool {
        self.warm_sync
    }

    fn is_dvdf_enabled(&self) -> bool {
        self.dvdf
    }

    fn status(&self) -> PairStatus {
        self.status
    }

    fn has_reverse_schedule(&self) -> Result<bool> {
        Ok(self.reverse_schedule)
    }

    fn clone_vm(&self) -> Option<CloneVm> {
        self.clone.clone()
    }

    fn validate_backup_job(&self, job: &str) -> CheckResult {
        self.check(&format!("backup_job({job})"))
    }

    fn validate_replication_job(&self, job: &str, full_replication: bool) -> CheckResult {
        self.check(&format!("replication_job({job},{full_replication})"))
    }

    fn validate_backups_synced(&self, job: &str) -> CheckResult {
        self.check(&format!("backups_synced({job})"))
    }

    fn validate_power_state(&self, _expected: PowerState) -> CheckResult {
        self.check("power_state")
    }

    fn validate_sync_status(&self, _expected: SyncStatus) -> CheckResult {
        self.check("sync_status")
    }

    fn validate_failover_status(&self, _allowed: &[FailoverStatus]) -> CheckResult {
        self.check("failover_status")
    }

    fn validate_dvdf(&self) -> CheckResult {
        self.check("dvdf")
    }

    fn validate_warm_sync(&self, cleanup: bool) -> CheckResult {
        self.check(&format!("warm_sync({cleanup})"))
    }

    fn validate_boot(&self, source: bool) -> CheckResult {
        self.check(&format!("boot({source})"))
    }

    fn validate_hardware(&self, source: bool, blobs_retained: Option<bool>) -> CheckResult {
        self.check(&format!("hardware({source},{blobs_retained:?})"))
    }

    fn validate_advanced(&self, source: bool) -> CheckResult {
        self.check(&format!("advanced({source})"))
    }

    fn validate_test_data(&self, source: bool) -> CheckResult {
        self.check(&format!("test_data({source})"))
    }

    fn validate_no_test_data(&self, source: bool) -> CheckResult {
        self.check(&format!("no_test_data({source})"))
    }

    fn add_test_data(&mut self, source: bool) -> Result<()> {
        self.log.push(format!("{}:add_test_data({source})", self.role));
        Ok(())
    }

    fn validate_clone_expired(&self) -> CheckResult {
        self.check("clone_expired")
    }
}

pub struct MockInstance {
    pub kind: String,
    pub supports_failback: bool,
}

impl InstanceService for MockInstance {
    fn instance_kind(&self) -> Result<String> {
        Ok(self.kind.clone())
    }

    fn supports_failback(&self, _vm: &str) -> Result<bool> {
        Ok(self.supports_failback)
    }
}

pub struct MockContext {
    pub source: MockInstance,
    pub destination: MockInstance,
    pub associations: BTreeMap<VmId, ReplicationAssociation>,
    pub handle: MockHandle,
    /// Per source VM replacements for `handle`.
    pub handles: BTreeMap<VmId, MockHandle>,
}

impl MockContext {
    pub fn new(destination_kind: &str) -> Self {
        Self {
            source: MockInstance {
                kind: "vmware".into(),
                supports_failback: true,
            },
            destination: MockInstance {
                kind: destination_kind.into(),
                supports_failback: true,
            },
            associations: BTreeMap::new(),
            handle: MockHandle::default(),
            handles: BTreeMap::new(),
        }
    }

    pub fn with_pairs(mut self, vms: &[&str]) -> Self {
        for vm in vms {
            self.associations.insert(
                vm.to_string(),
                ReplicationAssociation {
                    source_vm: vm.to_string(),
                    destination_vm: format!("{vm}_DR"),
                    aux_copy: false,
                    snapshot_based: false,
                },
            );
        }
        self
    }

    pub fn with_aux_copy(mut self) -> Self {
        for association in self.associations.values_mut() {
            association.aux_copy = true;
        }
        self
    }

    pub fn with_snapshot_based(mut self) -> Self {
        for association in self.associations.values_mut() {
            association.snapshot_based = true;
        }
        self
    }

    pub fn with_failback_support(mut self, supported: bool) -> Self {
        self.source.supports_failback = supported;
        self
    }

    pub fn with_handle(mut self, handle: MockHandle) -> Self {
        self.handle = handle;
        self
    }

    /// Use `handle` for `vm` only; it shares the call log of the default handle.
    pub fn with_handle_for(mut self, vm: &str, handle: MockHandle) -> Self {
        let log = self.handle.log.clone();
        self.handles
            .insert(vm.to_string(), MockHandle { log, ..handle });
        self
    }

    pub fn log(&self) -> &CallLog {
        &self.handle.log
    }
}

impl OperationContext for MockContext {
    fn association(&self, source_vm: &str) -> Result<ReplicationAssociation> {
        self.associations.get(source_vm).cloned().ok_or_else(|| {
            DrError::InvalidConfiguration(format!("'{source_vm}' is not in the replication group"))
        })
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
        let handle = self
            .handles
            .get(&association.source_vm)
            .unwrap_or(&self.handle);
        Ok(Box::new(MockHandle {
            role,
            ..handle.clone()
        }))
    }
}

pub struct MockJobs {
    pub job_id: JobId,
    pub state: JobState,
    pub phases: BTreeMap<VmId, Vec<PhaseRecord>>,
    pub blobs_retained: bool,
    pub triggered: Mutex<Vec<(OperationType, Vec<VmId>)>>,
    pub phase_calls: AtomicUsize,
}

impl MockJobs {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Completed,
            phases: BTreeMap::new(),
            blobs_retained: false,
            triggered: Mutex::new(Vec::new()),
            phase_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_trace(mut self, vm: &str, records: Vec<PhaseRecord>) -> Self {
        self.phases.insert(vm.to_string(), records);
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn triggered(&self) -> Vec<(OperationType, Vec<VmId>)> {
        self.triggered.lock().unwrap().clone()
    }
}

impl JobService for MockJobs {
    fn trigger(&self, op: OperationType, source_vms: &[VmId]) -> Result<JobId> {
        self.triggered.lock().unwrap().push((op, source_vms.to_vec()));
        Ok(self.job_id.clone())
    }

    fn wait(&self, _job: &str) -> Result<JobState> {
        Ok(self.state)
    }

    fn phases(&self, _job: &str) -> Result<BTreeMap<VmId, Vec<PhaseRecord>>> {
        self.phase_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.phases.clone())
    }

    fn blobs_retained(&self, _job: &str) -> Result<bool> {
        Ok(self.blobs_retained)
    }
}

/// Trace containing exactly the phases of `entry`, with sub-job ids attached.
pub fn synthetic_trace(entry: &CatalogEntry) -> Vec<PhaseRecord> {
    let phases: BTreeSet<_> = entry
        .source
        .iter()
        .chain(&entry.destination)
        .chain(&entry.clone)
        .copied()
        .collect();
    phases
        .into_iter()
        .enumerate()
        .map(|(i, phase)| {
            if phase.carries_job() {
                PhaseRecord::with_job(phase, format!("{}", 9000 + i))
            } else {
                PhaseRecord::new(phase)
            }
        })
        .collect()
}

/// Settle that returns at once and records every requested delay.
#[derive(Default)]
pub struct RecordingSettle {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSettle {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

impl Settle for RecordingSettle {
    fn settle(&self, delay: Duration) -> Result<()> {
        self.waits.lock().unwrap().push(delay);
        Ok(())
    }
}
