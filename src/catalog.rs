//! Operation catalog: expected phase sets per operation and replication variant.
//!
//! The built-in table is authored as three literal tables:
//!
//! * `BASE`: phases of plain periodic replication per operation and hypervisor;
//! * `SUPPORT`: which replication features each hypervisor can run;
//! * `DELTAS`: phases a feature adds to or removes from the base rows.
//!
//! `Catalog::builtin()` enumerates every `VariantKey` for every operation.
//! Keys a hypervisor cannot run are registered as unsupported entries with
//! empty sets, continuous keys are registered with empty sets, so a lookup
//! against the built-in table never falls through to a missing entry. A
//! catalog assembled by hand with `register` can still miss entries, and a
//! missing entry is always an error rather than an empty default.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{DrError, Result};
use crate::model::{
    CatalogOverride, HypervisorKind, OperationType, PhaseName, PhaseSet, Side, VariantKey,
};

use HypervisorKind::{Aws, AzureResourceManager, HyperV, Vmware};
use OperationType::{
    Failback, PlannedFailover, ReverseReplication, TestFailover, UndoFailover, UnplannedFailover,
};
use PhaseName::{
    AuxCopy, Backup, CreateDrVm, CreateSnapshot, CreateVm, DeleteDrVm, DeleteSnapshot, DisableSync,
    EnableSync, LiveMount, PostOperation, PostVmFailover, PowerOn, Replication, RevertSnapshot,
    Shutdown,
};

struct BaseRow {
    op: OperationType,
    hypervisor: HypervisorKind,
    source: &'static [PhaseName],
    destination: &'static [PhaseName],
}

const fn row(
    op: OperationType,
    hypervisor: HypervisorKind,
    source: &'static [PhaseName],
    destination: &'static [PhaseName],
) -> BaseRow {
    BaseRow {
        op,
        hypervisor,
        source,
        destination,
    }
}

#[rustfmt::skip]
const BASE: &[BaseRow] = &[
    // vmware
    row(TestFailover,       Vmware, &[], &[PowerOn, PostOperation]),
    row(PlannedFailover,    Vmware, &[Shutdown, DisableSync, Backup, Replication],
                                    &[CreateSnapshot, PowerOn, DeleteSnapshot, PostOperation, PostVmFailover]),
    row(UnplannedFailover,  Vmware, &[DisableSync],
                                    &[CreateSnapshot, PowerOn, PostOperation, PostVmFailover]),
    row(Failback,           Vmware, &[PowerOn, EnableSync, PostOperation], &[Shutdown, Backup, Replication]),
    row(UndoFailover,       Vmware, &[PowerOn, EnableSync], &[Shutdown, RevertSnapshot, DeleteSnapshot]),
    row(ReverseReplication, Vmware, &[], &[Backup, Replication]),
    // azure resource manager
    row(TestFailover,       AzureResourceManager, &[], &[PowerOn, PostOperation]),
    row(PlannedFailover,    AzureResourceManager, &[Shutdown, DisableSync, Backup, Replication],
                                                  &[CreateSnapshot, PowerOn, PostOperation, PostVmFailover]),
    row(UnplannedFailover,  AzureResourceManager, &[DisableSync],
                                                  &[CreateSnapshot, PowerOn, PostOperation, PostVmFailover]),
    row(Failback,           AzureResourceManager, &[PowerOn, EnableSync, PostOperation],
                                                  &[Shutdown, Backup, Replication]),
    row(UndoFailover,       AzureResourceManager, &[PowerOn, EnableSync],
                                                  &[Shutdown, RevertSnapshot, DeleteSnapshot]),
    row(ReverseReplication, AzureResourceManager, &[], &[Backup, Replication]),
    // hyper-v keeps no checkpoint on failover
    row(TestFailover,       HyperV, &[], &[PowerOn, PostOperation]),
    row(PlannedFailover,    HyperV, &[Shutdown, DisableSync, Backup, Replication],
                                    &[PowerOn, PostOperation, PostVmFailover]),
    row(UnplannedFailover,  HyperV, &[DisableSync], &[PowerOn, PostOperation, PostVmFailover]),
    row(Failback,           HyperV, &[PowerOn, EnableSync, PostOperation], &[Shutdown, Backup, Replication]),
    row(UndoFailover,       HyperV, &[PowerOn, EnableSync], &[Shutdown]),
    row(ReverseReplication, HyperV, &[], &[Backup, Replication]),
    // aws
    row(TestFailover,       Aws, &[], &[PowerOn, PostOperation]),
    row(PlannedFailover,    Aws, &[Shutdown, DisableSync, Backup, Replication],
                                 &[CreateSnapshot, PowerOn, PostOperation, PostVmFailover]),
    row(UnplannedFailover,  Aws, &[DisableSync], &[CreateSnapshot, PowerOn, PostOperation, PostVmFailover]),
    row(Failback,           Aws, &[PowerOn, EnableSync, PostOperation], &[Shutdown, Backup, Replication]),
    row(UndoFailover,       Aws, &[PowerOn, EnableSync], &[Shutdown, RevertSnapshot, DeleteSnapshot]),
    row(ReverseReplication, Aws, &[], &[Backup, Replication]),
];

struct Support {
    hypervisor: HypervisorKind,
    aux_copy: bool,
    warm_sync: bool,
    dvdf: bool,
    snapshot_based: bool,
    continuous: bool,
}

#[rustfmt::skip]
const SUPPORT: &[Support] = &[
    Support { hypervisor: Vmware,               aux_copy: true, warm_sync: true,  dvdf: false, snapshot_based: true,  continuous: true },
    Support { hypervisor: AzureResourceManager, aux_copy: true, warm_sync: true,  dvdf: true,  snapshot_based: false, continuous: false },
    Support { hypervisor: HyperV,               aux_copy: true, warm_sync: false, dvdf: false, snapshot_based: true,  continuous: false },
    Support { hypervisor: Aws,                  aux_copy: true, warm_sync: true,  dvdf: false, snapshot_based: false, continuous: false },
];

#[derive(Clone, Copy)]
enum Feature {
    AuxCopy,
    WarmSync,
    Dvdf,
}

impl Feature {
    fn enabled(&self, key: &VariantKey) -> bool {
        match self {
            Feature::AuxCopy => key.aux_copy,
            Feature::WarmSync => key.warm_sync,
            Feature::Dvdf => key.dvdf,
        }
    }
}

struct Delta {
    feature: Feature,
    ops: &'static [OperationType],
    side: Side,
    add: &'static [PhaseName],
    remove: &'static [PhaseName],
}

#[rustfmt::skip]
const DELTAS: &[Delta] = &[
    // aux copy runs beside every backup
    Delta { feature: Feature::AuxCopy,  ops: &[PlannedFailover], side: Side::Source,
            add: &[AuxCopy], remove: &[] },
    Delta { feature: Feature::AuxCopy,  ops: &[Failback, ReverseReplication], side: Side::Destination,
            add: &[AuxCopy], remove: &[] },
    Delta { feature: Feature::WarmSync, ops: &[PlannedFailover, UnplannedFailover], side: Side::Destination,
            add: &[CreateDrVm], remove: &[] },
    Delta { feature: Feature::WarmSync, ops: &[Failback, UndoFailover], side: Side::Destination,
            add: &[DeleteDrVm], remove: &[] },
    // a DVDF destination is deployed fresh, there is nothing to snapshot or revert
    Delta { feature: Feature::Dvdf,     ops: &[PlannedFailover, UnplannedFailover], side: Side::Destination,
            add: &[CreateDrVm], remove: &[CreateSnapshot, DeleteSnapshot] },
    Delta { feature: Feature::Dvdf,     ops: &[Failback, UndoFailover], side: Side::Destination,
            add: &[DeleteDrVm], remove: &[RevertSnapshot, DeleteSnapshot] },
];

/// Phase that creates the test failover clone.
fn clone_phase(key: &VariantKey) -> PhaseName {
    if key.snapshot_based {
        return LiveMount;
    }
    if key.warm_sync {
        return CreateVm;
    }
    match key.hypervisor {
        Vmware | HyperV => PhaseName::CloneVm,
        AzureResourceManager | Aws => CreateVm,
    }
}

fn is_supported(key: &VariantKey) -> bool {
    let Some(support) = SUPPORT.iter().find(|s| s.hypervisor == key.hypervisor) else {
        return false;
    };
    if key.continuous {
        // journal based replication takes no periodic feature
        return support.continuous
            && !(key.aux_copy || key.warm_sync || key.dvdf || key.snapshot_based);
    }
    if key.warm_sync && key.dvdf {
        return false;
    }
    (!key.aux_copy || support.aux_copy)
        && (!key.warm_sync || support.warm_sync)
        && (!key.dvdf || support.dvdf)
        && (!key.snapshot_based || support.snapshot_based)
}

fn set(phases: &[PhaseName]) -> PhaseSet {
    phases.iter().copied().collect()
}

/// Expected phases of one operation for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub source: PhaseSet,
    pub destination: PhaseSet,
    /// Clone creation phases, Test Failover only.
    pub clone: PhaseSet,
    /// False for variants the hypervisor cannot run.
    pub supported: bool,
}

impl CatalogEntry {
    pub fn new(source: PhaseSet, destination: PhaseSet) -> Self {
        Self {
            source,
            destination,
            clone: PhaseSet::new(),
            supported: true,
        }
    }

    pub fn unsupported() -> Self {
        Self {
            source: PhaseSet::new(),
            destination: PhaseSet::new(),
            clone: PhaseSet::new(),
            supported: false,
        }
    }

    pub fn with_clone(mut self, clone: PhaseSet) -> Self {
        self.clone = clone;
        self
    }

    pub fn side(&self, side: Side) -> &PhaseSet {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.destination.is_empty() && self.clone.is_empty()
    }
}

/// Table of expected phase sets keyed by operation and variant.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<(OperationType, VariantKey), CatalogEntry>,
}

impl Catalog {
    /// An empty catalog; every lookup fails until entries are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The authored table for every operation and every variant key.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for op in OperationType::ALL {
            for key in VariantKey::all() {
                if let Some(entry) = authored_entry(op, &key) {
                    catalog.entries.insert((op, key), entry);
                }
            }
        }
        catalog
    }

    /// Register or replace an entry, returning the previous one.
    pub fn register(
        &mut self,
        op: OperationType,
        key: VariantKey,
        entry: CatalogEntry,
    ) -> Result<Option<CatalogEntry>> {
        if key.continuous && !entry.is_empty() {
            return Err(DrError::InvalidConfiguration(format!(
                "continuous variant {key} cannot expect phases for {op}"
            )));
        }
        if op != OperationType::TestFailover && !entry.clone.is_empty() {
            return Err(DrError::InvalidConfiguration(format!(
                "clone phases are only meaningful for {}, not {op}",
                OperationType::TestFailover
            )));
        }
        Ok(self.entries.insert((op, key), entry))
    }

    /// Replace entries with the overrides carried by a request.
    pub fn apply_overrides(&mut self, overrides: &[CatalogOverride]) -> Result<()> {
        for o in overrides {
            let entry = CatalogEntry::new(o.source.clone(), o.destination.clone())
                .with_clone(o.clone.clone());
            self.register(o.operation, o.key, entry)?;
            tracing::debug!(operation = %o.operation, key = %o.key, "catalog entry overridden");
        }
        Ok(())
    }

    pub fn entry(&self, op: OperationType, key: &VariantKey) -> Result<&CatalogEntry> {
        self.entries
            .get(&(op, *key))
            .ok_or(DrError::MissingCatalogEntry { op, key: *key })
    }

    /// Expected phases of `op` on one side of a pair replicated as `key`.
    pub fn lookup(&self, op: OperationType, key: &VariantKey, side: Side) -> Result<PhaseSet> {
        Ok(self.entry(op, key)?.side(side).clone())
    }

    /// Phases that create the Test Failover clone for `key`.
    pub fn clone_phases(&self, key: &VariantKey) -> Result<PhaseSet> {
        Ok(self.entry(OperationType::TestFailover, key)?.clone.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(OperationType, VariantKey), &CatalogEntry)> {
        self.entries.iter()
    }
}

fn authored_entry(op: OperationType, key: &VariantKey) -> Option<CatalogEntry> {
    if !is_supported(key) {
        return Some(CatalogEntry::unsupported());
    }
    if key.continuous {
        return Some(CatalogEntry::new(PhaseSet::new(), PhaseSet::new()));
    }
    let base = BASE
        .iter()
        .find(|row| row.op == op && row.hypervisor == key.hypervisor)?;
    let mut source = set(base.source);
    let mut destination = set(base.destination);
    for delta in DELTAS
        .iter()
        .filter(|d| d.feature.enabled(key) && d.ops.contains(&op))
    {
        let target = match delta.side {
            Side::Source => &mut source,
            Side::Destination => &mut destination,
        };
        for phase in delta.remove {
            target.remove(phase);
        }
        target.extend(delta.add.iter().copied());
    }
    let mut entry = CatalogEntry::new(source, destination);
    if op == OperationType::TestFailover {
        entry.clone = set(&[clone_phase(key)]);
    }
    Some(entry)
}
