use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{DrError, Result};

/// Identifier of a VM as known to the hypervisor instance.
pub type VmId = String;

/// Identifier of a DR orchestration job.
pub type JobId = String;

/// Order-irrelevant set of phase names.
pub type PhaseSet = BTreeSet<PhaseName>;

/// DR operation driven against a set of VM pairs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    TestFailover,
    PlannedFailover,
    UnplannedFailover,
    Failback,
    UndoFailover,
    ReverseReplication,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::TestFailover,
        OperationType::PlannedFailover,
        OperationType::UnplannedFailover,
        OperationType::Failback,
        OperationType::UndoFailover,
        OperationType::ReverseReplication,
    ];

    /// Job type label reported by the orchestration service.
    pub fn job_type(&self) -> &'static str {
        match self {
            OperationType::TestFailover => "Test Failover",
            OperationType::PlannedFailover => "Planned Failover",
            OperationType::UnplannedFailover => "Unplanned Failover",
            OperationType::Failback => "Failback",
            OperationType::UndoFailover => "Undo Failover",
            OperationType::ReverseReplication => "Reverse Replication",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_type())
    }
}

/// Hypervisor backing the destination of a replication pair.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorKind {
    Vmware,
    AzureResourceManager,
    HyperV,
    Aws,
}

impl HypervisorKind {
    pub const ALL: [HypervisorKind; 4] = [
        HypervisorKind::Vmware,
        HypervisorKind::AzureResourceManager,
        HypervisorKind::HyperV,
        HypervisorKind::Aws,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorKind::Vmware => "vmware",
            HypervisorKind::AzureResourceManager => "azure-resource-manager",
            HypervisorKind::HyperV => "hyper-v",
            HypervisorKind::Aws => "aws",
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypervisorKind {
    type Err = DrError;

    /// Parses the instance kind string reported by an instance service.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmware" => Ok(HypervisorKind::Vmware),
            "azure resource manager" | "azure-resource-manager" | "azure" => {
                Ok(HypervisorKind::AzureResourceManager)
            }
            "hyper-v" | "hyperv" => Ok(HypervisorKind::HyperV),
            "amazon web services" | "amazon" | "aws" => Ok(HypervisorKind::Aws),
            other => Err(DrError::InvalidConfiguration(format!(
                "unknown hypervisor instance kind '{other}'"
            ))),
        }
    }
}

/// Structured catalog key describing how a pair is replicated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct VariantKey {
    pub hypervisor: HypervisorKind,
    #[serde(default)]
    pub aux_copy: bool,
    #[serde(default)]
    pub warm_sync: bool,
    #[serde(default)]
    pub dvdf: bool,
    #[serde(default)]
    pub snapshot_based: bool,
    #[serde(default)]
    pub continuous: bool,
}

impl VariantKey {
    /// Plain periodic replication on `hypervisor` with no features enabled.
    pub fn periodic(hypervisor: HypervisorKind) -> Self {
        Self {
            hypervisor,
            aux_copy: false,
            warm_sync: false,
            dvdf: false,
            snapshot_based: false,
            continuous: false,
        }
    }

    pub fn with_aux_copy(mut self) -> Self {
        self.aux_copy = true;
        self
    }

    pub fn with_warm_sync(mut self) -> Self {
        self.warm_sync = true;
        self
    }

    pub fn with_dvdf(mut self) -> Self {
        self.dvdf = true;
        self
    }

    pub fn with_snapshot_based(mut self) -> Self {
        self.snapshot_based = true;
        self
    }

    pub fn with_continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    /// Every key: each hypervisor crossed with all feature flags and modes.
    pub fn all() -> impl Iterator<Item = VariantKey> {
        HypervisorKind::ALL.into_iter().flat_map(|hypervisor| {
            (0u8..32).map(move |bits| VariantKey {
                hypervisor,
                aux_copy: bits & 0b00001 != 0,
                warm_sync: bits & 0b00010 != 0,
                dvdf: bits & 0b00100 != 0,
                snapshot_based: bits & 0b01000 != 0,
                continuous: bits & 0b10000 != 0,
            })
        })
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.aux_copy {
            flags.push("aux_copy");
        }
        if self.warm_sync {
            flags.push("warm_sync");
        }
        if self.dvdf {
            flags.push("dvdf");
        }
        if self.snapshot_based {
            flags.push("snapshot_based");
        }
        flags.push(if self.continuous { "continuous" } else { "periodic" });
        write!(f, "{}[{}]", self.hypervisor, flags.join(","))
    }
}

/// Named stage of a DR job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseName {
    Shutdown,
    PowerOff,
    Backup,
    AuxCopy,
    Replication,
    CreateSnapshot,
    RevertSnapshot,
    DeleteSnapshot,
    PowerOn,
    EnableSync,
    DisableSync,
    CreateDrVm,
    DeleteDrVm,
    CloneVm,
    CreateVm,
    LiveMount,
    PostOperation,
    PostVmFailover,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Shutdown => "SHUTDOWN",
            PhaseName::PowerOff => "POWER_OFF",
            PhaseName::Backup => "BACKUP",
            PhaseName::AuxCopy => "AUX_COPY",
            PhaseName::Replication => "REPLICATION",
            PhaseName::CreateSnapshot => "CREATE_SNAPSHOT",
            PhaseName::RevertSnapshot => "REVERT_SNAPSHOT",
            PhaseName::DeleteSnapshot => "DELETE_SNAPSHOT",
            PhaseName::PowerOn => "POWER_ON",
            PhaseName::EnableSync => "ENABLE_SYNC",
            PhaseName::DisableSync => "DISABLE_SYNC",
            PhaseName::CreateDrVm => "CREATE_DR_VM",
            PhaseName::DeleteDrVm => "DELETE_DR_VM",
            PhaseName::CloneVm => "CLONE_VM",
            PhaseName::CreateVm => "CREATE_VM",
            PhaseName::LiveMount => "LIVE_MOUNT",
            PhaseName::PostOperation => "POST_OPERATION",
            PhaseName::PostVmFailover => "POST_VM_FAILOVER",
        }
    }

    /// Phases that spawn a sub-job whose id must be present in the trace.
    pub fn carries_job(&self) -> bool {
        matches!(self, PhaseName::Backup | PhaseName::Replication)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a replication pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn is_source(&self) -> bool {
        matches!(self, Side::Source)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Role a handle plays for a pair during one operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RoleName {
    Failover,
    Replication,
    Failback,
    TestFailover,
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleName::Failover => "failover",
            RoleName::Replication => "replication",
            RoleName::Failback => "failback",
            RoleName::TestFailover => "test_failover",
        };
        f.write_str(name)
    }
}

/// One executed phase for a VM, as reported by the job service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PhaseRecord {
    pub phase: PhaseName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_job_id: Option<JobId>,
}

impl PhaseRecord {
    pub fn new(phase: PhaseName) -> Self {
        Self {
            phase,
            sub_job_id: None,
        }
    }

    pub fn with_job(phase: PhaseName, sub_job_id: impl Into<JobId>) -> Self {
        Self {
            phase,
            sub_job_id: Some(sub_job_id.into()),
        }
    }

    /// Sub-job id, treating an empty string as absent.
    pub fn sub_job(&self) -> Option<&str> {
        self.sub_job_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Per-VM executed phases of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobTrace {
    pub job_id: JobId,
    #[serde(default)]
    pub per_vm: BTreeMap<VmId, Vec<PhaseRecord>>,
}

/// Terminal state of a DR job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Completed,
    CompletedWithErrors,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Completed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed w/ one or more errors",
            JobState::Failed => "failed",
            JobState::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Replication sync status of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    SyncDisabled,
    SyncPaused,
    NeedsSync,
}

/// Failover status of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    None,
    FailoverComplete,
    FailbackComplete,
    TestFailoverComplete,
}

/// Sync and failover status observed for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PairStatus {
    pub sync: SyncStatus,
    pub failover: FailoverStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Power {
    On,
    Off,
}

/// Expected power state of the VMs of a pair; `None` leaves a side unchecked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PowerState {
    pub source: Option<Power>,
    pub destination: Option<Power>,
}

impl PowerState {
    pub fn new(source: Option<Power>, destination: Option<Power>) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// What happens to the rest of a batch when one pair fails.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failing pair aborts the whole batch.
    #[default]
    FailFast,
    /// Every pair is validated and failures are reported together.
    Aggregate,
}

/// Replacement catalog entry supplied with a request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CatalogOverride {
    pub operation: OperationType,
    pub key: VariantKey,
    #[serde(default)]
    pub source: PhaseSet,
    #[serde(default)]
    pub destination: PhaseSet,
    #[serde(default)]
    pub clone: PhaseSet,
}

/// Tunables of one operation request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DrillOptions {
    /// Settle delay for continuous pairs after seeding test data (humantime, e.g. "2m").
    #[serde(default = "default_settle_delay")]
    pub settle_delay: String,
    /// Batch failure policy.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Worker count for per-pair validation (only used with the `parallel` feature).
    #[serde(default)]
    pub workers: Option<usize>,
    /// Whether replication sub-jobs are expected to be full replications.
    #[serde(default)]
    pub full_replication: bool,
    /// Test Failover only: check clone expiration instead of running the operation.
    #[serde(default)]
    pub post_expiration: bool,
}

fn default_settle_delay() -> String {
    "2m".to_string()
}

impl Default for DrillOptions {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            failure_policy: FailurePolicy::default(),
            workers: None,
            full_replication: false,
            post_expiration: false,
        }
    }
}

impl DrillOptions {
    pub fn settle_delay(&self) -> Result<Duration> {
        humantime::parse_duration(&self.settle_delay).map_err(|e| {
            DrError::InvalidConfiguration(format!(
                "invalid settle_delay '{}': {e}",
                self.settle_delay
            ))
        })
    }
}

/// One operation request: what to run against which source VMs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OperationRequest {
    pub operation: OperationType,
    /// Source VM names, one pair is built per entry.
    pub source_vms: Vec<VmId>,
    #[serde(default)]
    pub options: DrillOptions,
    #[serde(default)]
    pub catalog_overrides: Vec<CatalogOverride>,
}

impl OperationRequest {
    pub fn new(operation: OperationType, source_vms: Vec<VmId>) -> Self {
        Self {
            operation,
            source_vms,
            options: DrillOptions::default(),
            catalog_overrides: Vec::new(),
        }
    }

    /// Validate the request (basic sanity checks).
    pub fn validate(&self) -> Result<()> {
        if self.source_vms.is_empty() {
            return Err(DrError::InvalidConfiguration(
                "source_vms must not be empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for vm in &self.source_vms {
            if vm.trim().is_empty() {
                return Err(DrError::InvalidConfiguration(
                    "source VM names must not be blank".into(),
                ));
            }
            if !seen.insert(vm.as_str()) {
                return Err(DrError::InvalidConfiguration(format!(
                    "source VM '{vm}' listed more than once"
                )));
            }
        }
        self.options.settle_delay()?;
        if self.options.workers == Some(0) {
            return Err(DrError::InvalidConfiguration(
                "workers must be at least 1".into(),
            ));
        }
        if self.options.post_expiration && self.operation != OperationType::TestFailover {
            return Err(DrError::InvalidConfiguration(format!(
                "post_expiration only applies to {}, not {}",
                OperationType::TestFailover,
                self.operation
            )));
        }
        Ok(())
    }
}

/// Generate JSON Schema for the OperationRequest type.
pub fn generate_schema() -> String {
    let schema = schemars::schema_for!(OperationRequest);
    serde_json::to_string_pretty(&schema).expect("failed to serialize schema")
}

/// Load an OperationRequest from a JSON file.
pub fn load_request(path: &std::path::Path) -> anyhow::Result<OperationRequest> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let request = serde_json::from_reader(reader)?;
    Ok(request)
}

/// Create an OperationRequest from a JSON string.
pub fn from_json(json: &str) -> anyhow::Result<OperationRequest> {
    let request = serde_json::from_str(json)?;
    Ok(request)
}
