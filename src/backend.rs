//! Narrow interfaces to the services this engine drives but does not own:
//! hypervisor instances, the DR job service, and per-pair role handles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clone::CloneVm;
use crate::error::{CheckResult, Result};
use crate::model::{
    FailoverStatus, JobId, JobState, OperationType, PairStatus, PhaseRecord, PowerState, RoleName,
    SyncStatus, VmId,
};

/// A hypervisor instance (source or destination side of a replication).
pub trait InstanceService: Send + Sync {
    /// Instance kind as reported by the service, e.g. "vmware" or "Azure Resource Manager".
    fn instance_kind(&self) -> Result<String>;

    /// Whether `vm` can be failed back onto this instance.
    fn supports_failback(&self, vm: &str) -> Result<bool>;
}

/// DR orchestration job service. Every call blocks until the service answers.
pub trait JobService: Send + Sync {
    fn trigger(&self, op: OperationType, source_vms: &[VmId]) -> Result<JobId>;

    /// Poll until the job reaches a terminal state.
    fn wait(&self, job: &str) -> Result<JobState>;

    /// Executed phases per source VM.
    fn phases(&self, job: &str) -> Result<BTreeMap<VmId, Vec<PhaseRecord>>>;

    /// Whether storage blobs were kept when the job deployed the destination.
    fn blobs_retained(&self, job: &str) -> Result<bool>;
}

/// Live view of one pair in one role.
///
/// Checks return a `CheckFailure` describing what was observed; the
/// post-validator turns it into a named postcondition violation.
pub trait RoleHandle: Send + Sync {
    fn role(&self) -> RoleName;

    /// Re-read pair state from the source of truth.
    fn refresh(&mut self) -> Result<()>;

    fn is_continuous(&self) -> bool;
    fn is_warm_sync_enabled(&self) -> bool;
    fn is_dvdf_enabled(&self) -> bool;

    fn status(&self) -> PairStatus;
    fn has_reverse_schedule(&self) -> Result<bool>;

    /// Clone created by a Test Failover, if the handle tracks one.
    fn clone_vm(&self) -> Option<CloneVm> {
        None
    }

    fn validate_backup_job(&self, job: &str) -> CheckResult;
    fn validate_replication_job(&self, job: &str, full_replication: bool) -> CheckResult;

    /// Backups that were pending to sync when `job` started were replicated
    /// by it, and every one of them was incremental.
    fn validate_backups_synced(&self, job: &str) -> CheckResult;

    fn validate_power_state(&self, expected: PowerState) -> CheckResult;
    fn validate_sync_status(&self, expected: SyncStatus) -> CheckResult;
    fn validate_failover_status(&self, allowed: &[FailoverStatus]) -> CheckResult;
    fn validate_dvdf(&self) -> CheckResult;
    fn validate_warm_sync(&self, cleanup: bool) -> CheckResult;
    fn validate_boot(&self, source: bool) -> CheckResult;
    fn validate_hardware(&self, source: bool, blobs_retained: Option<bool>) -> CheckResult;
    fn validate_advanced(&self, source: bool) -> CheckResult;
    fn validate_test_data(&self, source: bool) -> CheckResult;
    fn validate_no_test_data(&self, source: bool) -> CheckResult;

    fn add_test_data(&mut self, source: bool) -> Result<()>;

    /// Clone is gone and its dependent resources were released.
    fn validate_clone_expired(&self) -> CheckResult;
}

/// Replication association of one source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ReplicationAssociation {
    pub source_vm: VmId,
    pub destination_vm: VmId,
    #[serde(default)]
    pub aux_copy: bool,
    #[serde(default)]
    pub snapshot_based: bool,
}

/// Everything the pair builder needs to know about a replication group.
pub trait OperationContext: Send + Sync {
    fn association(&self, source_vm: &str) -> Result<ReplicationAssociation>;
    fn source_instance(&self) -> &dyn InstanceService;
    fn destination_instance(&self) -> &dyn InstanceService;
    fn role_handle(
        &self,
        role: RoleName,
        association: &ReplicationAssociation,
    ) -> Result<Box<dyn RoleHandle>>;
}
