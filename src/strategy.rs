//! Per-operation behavior, one strategy value per operation type.
//!
//! A strategy says which roles a pair needs, what state the pair must be in
//! before the operation, where test data is seeded, and what the pair must
//! look like afterwards. The validators stay generic over operations.

use std::collections::BTreeMap;

use crate::backend::{OperationContext, ReplicationAssociation};
use crate::error::{DrError, Result};
use crate::model::{
    FailoverStatus, HypervisorKind, OperationType, Power, PowerState, RoleName, Side, SyncStatus,
    VariantKey,
};

/// State a pair must be in before an operation is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    /// Allowed sync statuses; empty accepts any.
    pub sync: &'static [SyncStatus],
    /// Allowed failover statuses; empty accepts any.
    pub failover: &'static [FailoverStatus],
    pub reverse_schedule: bool,
}

/// Whether test data must be present or absent on one side afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestDataExpectation {
    pub side: Side,
    pub present: bool,
}

/// State a pair must be in after an operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostExpectations {
    pub power: PowerState,
    pub sync: SyncStatus,
    pub failover: &'static [FailoverStatus],
    /// Warm sync check also verifies dependent resources were cleaned up.
    pub warm_sync_cleanup: bool,
    pub boot: Option<Side>,
    pub hardware: Option<Side>,
    /// Hardware check is parameterized by whether the job kept storage blobs.
    pub blobs_retained: bool,
    pub advanced: Option<Side>,
    pub test_data: Option<TestDataExpectation>,
    /// Backups pending at trigger time were replicated by the job and were
    /// all incremental.
    pub backups_synced: bool,
}

pub trait OperationStrategy: Send + Sync {
    fn operation(&self) -> OperationType;

    /// Roles a pair needs; the first one is the primary role.
    fn roles(&self) -> &'static [RoleName];

    /// Side that receives test data before the operation.
    fn seed_side(&self) -> Side;

    fn precondition(&self) -> Precondition;

    fn expectations(&self, key: &VariantKey) -> PostExpectations;

    /// Operation specific capability check run while building pairs.
    fn check_capability(
        &self,
        _ctx: &dyn OperationContext,
        _association: &ReplicationAssociation,
        _destination: HypervisorKind,
    ) -> Result<()> {
        Ok(())
    }

    fn job_type(&self) -> &'static str {
        self.operation().job_type()
    }

    /// `None` for a strategy that lists no roles.
    fn primary_role(&self) -> Option<RoleName> {
        self.roles().first().copied()
    }
}

const NOT_FAILED_OVER: &[FailoverStatus] = &[FailoverStatus::None, FailoverStatus::FailbackComplete];
const FAILED_OVER: &[FailoverStatus] = &[FailoverStatus::FailoverComplete];

pub struct TestFailoverStrategy;

impl OperationStrategy for TestFailoverStrategy {
    fn operation(&self) -> OperationType {
        OperationType::TestFailover
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::TestFailover]
    }

    fn seed_side(&self) -> Side {
        Side::Source
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[SyncStatus::InSync],
            failover: NOT_FAILED_OVER,
            reverse_schedule: false,
        }
    }

    fn expectations(&self, key: &VariantKey) -> PostExpectations {
        PostExpectations {
            // the clone runs, the DR VM itself stays off
            power: PowerState::new(Some(Power::On), Some(Power::Off)),
            sync: SyncStatus::InSync,
            failover: &[
                FailoverStatus::None,
                FailoverStatus::FailbackComplete,
                FailoverStatus::TestFailoverComplete,
            ],
            warm_sync_cleanup: false,
            boot: Some(Side::Destination),
            hardware: Some(Side::Destination),
            blobs_retained: false,
            advanced: Some(Side::Destination),
            test_data: Some(TestDataExpectation {
                side: Side::Destination,
                present: key.continuous,
            }),
            backups_synced: false,
        }
    }
}

pub struct PlannedFailoverStrategy;

impl OperationStrategy for PlannedFailoverStrategy {
    fn operation(&self) -> OperationType {
        OperationType::PlannedFailover
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::Failover, RoleName::Replication]
    }

    fn seed_side(&self) -> Side {
        Side::Source
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[SyncStatus::InSync],
            failover: NOT_FAILED_OVER,
            reverse_schedule: false,
        }
    }

    fn expectations(&self, _key: &VariantKey) -> PostExpectations {
        PostExpectations {
            power: PowerState::new(Some(Power::Off), Some(Power::On)),
            sync: SyncStatus::SyncDisabled,
            failover: FAILED_OVER,
            warm_sync_cleanup: false,
            boot: Some(Side::Destination),
            hardware: Some(Side::Destination),
            blobs_retained: true,
            advanced: Some(Side::Destination),
            // the failover job backs up and replicates the seeded data
            test_data: Some(TestDataExpectation {
                side: Side::Destination,
                present: true,
            }),
            backups_synced: true,
        }
    }
}

pub struct UnplannedFailoverStrategy;

impl OperationStrategy for UnplannedFailoverStrategy {
    fn operation(&self) -> OperationType {
        OperationType::UnplannedFailover
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::Failover, RoleName::Replication]
    }

    fn seed_side(&self) -> Side {
        Side::Source
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[],
            failover: NOT_FAILED_OVER,
            reverse_schedule: false,
        }
    }

    fn expectations(&self, key: &VariantKey) -> PostExpectations {
        PostExpectations {
            // the source may be unreachable after a disaster
            power: PowerState::new(None, Some(Power::On)),
            sync: SyncStatus::SyncDisabled,
            failover: FAILED_OVER,
            warm_sync_cleanup: false,
            boot: Some(Side::Destination),
            hardware: Some(Side::Destination),
            blobs_retained: true,
            advanced: Some(Side::Destination),
            // no final backup runs; only a journal has already shipped the data
            test_data: Some(TestDataExpectation {
                side: Side::Destination,
                present: key.continuous,
            }),
            backups_synced: false,
        }
    }
}

pub struct FailbackStrategy;

impl OperationStrategy for FailbackStrategy {
    fn operation(&self) -> OperationType {
        OperationType::Failback
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::Failback, RoleName::Replication]
    }

    fn seed_side(&self) -> Side {
        Side::Destination
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[],
            failover: FAILED_OVER,
            reverse_schedule: false,
        }
    }

    fn expectations(&self, _key: &VariantKey) -> PostExpectations {
        PostExpectations {
            power: PowerState::new(Some(Power::On), Some(Power::Off)),
            sync: SyncStatus::InSync,
            failover: &[FailoverStatus::FailbackComplete],
            warm_sync_cleanup: true,
            boot: Some(Side::Source),
            hardware: Some(Side::Source),
            blobs_retained: false,
            advanced: None,
            test_data: Some(TestDataExpectation {
                side: Side::Source,
                present: true,
            }),
            backups_synced: true,
        }
    }

    fn check_capability(
        &self,
        ctx: &dyn OperationContext,
        association: &ReplicationAssociation,
        destination: HypervisorKind,
    ) -> Result<()> {
        if destination == HypervisorKind::HyperV
            && !ctx
                .source_instance()
                .supports_failback(&association.source_vm)?
        {
            return Err(DrError::UnsupportedOperation {
                op: OperationType::Failback,
                vm: association.source_vm.clone(),
                reason: format!(
                    "destination is {destination} and the source VM does not report failback support"
                ),
            });
        }
        Ok(())
    }
}

pub struct UndoFailoverStrategy;

impl OperationStrategy for UndoFailoverStrategy {
    fn operation(&self) -> OperationType {
        OperationType::UndoFailover
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::Failback]
    }

    fn seed_side(&self) -> Side {
        Side::Destination
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[],
            failover: FAILED_OVER,
            reverse_schedule: false,
        }
    }

    fn expectations(&self, _key: &VariantKey) -> PostExpectations {
        PostExpectations {
            power: PowerState::new(Some(Power::On), Some(Power::Off)),
            sync: SyncStatus::InSync,
            failover: NOT_FAILED_OVER,
            warm_sync_cleanup: true,
            boot: Some(Side::Source),
            hardware: None,
            blobs_retained: false,
            advanced: None,
            // destination changes are discarded
            test_data: Some(TestDataExpectation {
                side: Side::Source,
                present: false,
            }),
            backups_synced: false,
        }
    }
}

pub struct ReverseReplicationStrategy;

impl OperationStrategy for ReverseReplicationStrategy {
    fn operation(&self) -> OperationType {
        OperationType::ReverseReplication
    }

    fn roles(&self) -> &'static [RoleName] {
        &[RoleName::Replication]
    }

    fn seed_side(&self) -> Side {
        Side::Destination
    }

    fn precondition(&self) -> Precondition {
        Precondition {
            sync: &[],
            failover: FAILED_OVER,
            reverse_schedule: true,
        }
    }

    fn expectations(&self, _key: &VariantKey) -> PostExpectations {
        PostExpectations {
            power: PowerState::new(Some(Power::Off), Some(Power::On)),
            sync: SyncStatus::SyncDisabled,
            failover: FAILED_OVER,
            warm_sync_cleanup: false,
            boot: None,
            hardware: None,
            blobs_retained: false,
            advanced: None,
            test_data: Some(TestDataExpectation {
                side: Side::Source,
                present: true,
            }),
            backups_synced: true,
        }
    }
}

/// Strategies keyed by the operation they implement.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<OperationType, Box<dyn OperationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One strategy for every operation type.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TestFailoverStrategy));
        registry.register(Box::new(PlannedFailoverStrategy));
        registry.register(Box::new(UnplannedFailoverStrategy));
        registry.register(Box::new(FailbackStrategy));
        registry.register(Box::new(UndoFailoverStrategy));
        registry.register(Box::new(ReverseReplicationStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn OperationStrategy>) {
        self.strategies.insert(strategy.operation(), strategy);
    }

    pub fn get(&self, op: OperationType) -> Result<&dyn OperationStrategy> {
        self.strategies
            .get(&op)
            .map(|s| s.as_ref())
            .ok_or_else(|| {
                DrError::InvalidConfiguration(format!("no strategy registered for {op}"))
            })
    }
}
