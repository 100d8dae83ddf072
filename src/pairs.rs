use std::collections::BTreeMap;
use std::fmt;

use crate::backend::{OperationContext, RoleHandle};
use crate::catalog::Catalog;
use crate::clone::CloneVm;
use crate::error::{DrError, Result};
use crate::model::{HypervisorKind, OperationType, RoleName, VariantKey, VmId};
use crate::strategy::StrategyRegistry;

/// One replicated (source, destination) VM pair prepared for an operation.
pub struct VmPair {
    pub source_vm: VmId,
    pub destination_vm: VmId,
    pub variant: VariantKey,
    pub roles: BTreeMap<RoleName, Box<dyn RoleHandle>>,
    pub primary: RoleName,
    /// Test Failover clone tracked for this pair.
    pub clone: Option<CloneVm>,
}

impl VmPair {
    pub fn role(&self, role: RoleName) -> Option<&dyn RoleHandle> {
        self.roles.get(&role).map(|handle| handle.as_ref())
    }

    /// Handle that owns state assertions for this pair.
    pub fn primary(&self) -> Result<&dyn RoleHandle> {
        self.role(self.primary)
            .ok_or_else(|| missing_role(&self.source_vm, self.primary))
    }

    pub fn primary_mut(&mut self) -> Result<&mut (dyn RoleHandle + 'static)> {
        let primary = self.primary;
        let source_vm = &self.source_vm;
        self.roles
            .get_mut(&primary)
            .map(|handle| handle.as_mut())
            .ok_or_else(|| missing_role(source_vm, primary))
    }

    /// Handle that validates BACKUP and REPLICATION sub-jobs.
    pub fn job_handle(&self) -> Result<&dyn RoleHandle> {
        match self.role(RoleName::Replication) {
            Some(handle) => Ok(handle),
            None => self.primary(),
        }
    }

    /// Re-read every role handle from the source of truth.
    pub fn refresh(&mut self) -> Result<()> {
        for handle in self.roles.values_mut() {
            handle.refresh()?;
        }
        Ok(())
    }
}

fn missing_role(source_vm: &str, role: RoleName) -> DrError {
    DrError::InvalidConfiguration(format!("pair '{source_vm}' has no {role} role handle"))
}

impl fmt::Debug for VmPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPair")
            .field("source_vm", &self.source_vm)
            .field("destination_vm", &self.destination_vm)
            .field("variant", &self.variant)
            .field("roles", &self.roles.keys().collect::<Vec<_>>())
            .field("clone", &self.clone)
            .finish()
    }
}

/// Build one pair per source VM for `op`.
///
/// Fails on the first VM that cannot run the operation; no pairs are
/// returned in that case.
pub fn build(
    op: OperationType,
    source_vms: &[VmId],
    ctx: &dyn OperationContext,
    catalog: &Catalog,
    strategies: &StrategyRegistry,
) -> Result<BTreeMap<VmId, VmPair>> {
    if source_vms.is_empty() {
        return Err(DrError::InvalidConfiguration(format!(
            "{op} requested without source VMs"
        )));
    }
    let strategy = strategies.get(op)?;
    let destination_kind: HypervisorKind = ctx.destination_instance().instance_kind()?.parse()?;

    let mut pairs = BTreeMap::new();
    for vm in source_vms {
        if pairs.contains_key(vm) {
            return Err(DrError::InvalidConfiguration(format!(
                "source VM '{vm}' listed more than once"
            )));
        }
        let association = ctx.association(vm)?;
        strategy.check_capability(ctx, &association, destination_kind)?;

        let mut roles = BTreeMap::new();
        for &role in strategy.roles() {
            roles.insert(role, ctx.role_handle(role, &association)?);
        }
        let Some(primary_role) = strategy.primary_role() else {
            return Err(DrError::InvalidConfiguration(format!(
                "strategy for {op} lists no roles"
            )));
        };
        let Some(primary) = roles.get(&primary_role) else {
            return Err(DrError::InvalidConfiguration(format!(
                "strategy for {op} does not list its primary role {primary_role}"
            )));
        };

        let variant = VariantKey {
            hypervisor: destination_kind,
            aux_copy: association.aux_copy,
            warm_sync: primary.is_warm_sync_enabled(),
            dvdf: primary.is_dvdf_enabled(),
            snapshot_based: association.snapshot_based,
            continuous: primary.is_continuous(),
        };
        if !catalog.entry(op, &variant)?.supported {
            return Err(DrError::UnsupportedOperation {
                op,
                vm: vm.clone(),
                reason: format!("replication variant {variant} is not supported"),
            });
        }

        let clone = (op == OperationType::TestFailover).then(|| {
            primary
                .clone_vm()
                .unwrap_or_else(|| CloneVm::pending(format!("{}_clone", association.destination_vm)))
        });

        tracing::debug!(
            source = %vm,
            destination = %association.destination_vm,
            variant = %variant,
            "built VM pair"
        );
        pairs.insert(
            vm.clone(),
            VmPair {
                source_vm: vm.clone(),
                destination_vm: association.destination_vm,
                variant,
                roles,
                primary: primary_role,
                clone,
            },
        );
    }
    tracing::info!(operation = %op, pairs = pairs.len(), "VM pairs built");
    Ok(pairs)
}
