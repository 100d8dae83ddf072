use crate::backend::RoleHandle;
use crate::error::{DrError, Result};
use crate::pairs::VmPair;
use crate::strategy::OperationStrategy;

/// Bring a pair into a known state before the operation is triggered.
///
/// Refreshes every role handle, checks the operation's precondition on the
/// primary handle, and seeds test data on the strategy's seed side. The
/// settle delay for continuous pairs is left to the caller, once per batch.
pub fn pre_validate(pair: &mut VmPair, strategy: &dyn OperationStrategy) -> Result<()> {
    pair.refresh()?;
    check_precondition(&pair.source_vm, strategy, pair.primary()?)?;

    let seed = strategy.seed_side();
    pair.primary_mut()?.add_test_data(seed.is_source())?;
    tracing::debug!(source = %pair.source_vm, side = %seed, "seeded test data");
    tracing::info!(source = %pair.source_vm, operation = %strategy.operation(), "pre-validation passed");
    Ok(())
}

fn check_precondition(
    vm: &str,
    strategy: &dyn OperationStrategy,
    handle: &dyn RoleHandle,
) -> Result<()> {
    let pre = strategy.precondition();
    let status = handle.status();
    if !pre.sync.is_empty() && !pre.sync.contains(&status.sync) {
        return Err(DrError::PreconditionViolation {
            vm: vm.to_string(),
            reason: format!(
                "sync status is {:?}, {} requires one of {:?}",
                status.sync,
                strategy.operation(),
                pre.sync
            ),
        });
    }
    if !pre.failover.is_empty() && !pre.failover.contains(&status.failover) {
        return Err(DrError::PreconditionViolation {
            vm: vm.to_string(),
            reason: format!(
                "failover status is {:?}, {} requires one of {:?}",
                status.failover,
                strategy.operation(),
                pre.failover
            ),
        });
    }
    if pre.reverse_schedule && !handle.has_reverse_schedule()? {
        return Err(DrError::PreconditionViolation {
            vm: vm.to_string(),
            reason: "no reverse replication schedule exists".into(),
        });
    }
    Ok(())
}
