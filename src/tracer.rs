use std::collections::BTreeMap;

use crate::backend::JobService;
use crate::error::Result;
use crate::model::{JobId, PhaseRecord, VmId};

/// Reads executed phases of finished jobs.
///
/// The job service returns the phases of every VM in one call; the result is
/// kept per job so a batch of pairs costs one query.
pub struct PhaseTracer<'a> {
    jobs: &'a dyn JobService,
    cache: BTreeMap<JobId, BTreeMap<VmId, Vec<PhaseRecord>>>,
}

impl<'a> PhaseTracer<'a> {
    pub fn new(jobs: &'a dyn JobService) -> Self {
        Self {
            jobs,
            cache: BTreeMap::new(),
        }
    }

    /// Phase records of `vm` in `job`, in execution order.
    ///
    /// A VM the job never touched yields an empty trace; the post-validator
    /// reports the first missing phase.
    pub fn fetch(&mut self, job: &str, vm: &str) -> Result<Vec<PhaseRecord>> {
        if !self.cache.contains_key(job) {
            let phases = self.jobs.phases(job)?;
            tracing::debug!(job, vms = phases.len(), "fetched job phases");
            self.cache.insert(job.to_string(), phases);
        }
        let records = self
            .cache
            .get(job)
            .and_then(|per_vm| per_vm.get(vm))
            .cloned()
            .unwrap_or_default();
        if records.is_empty() {
            tracing::warn!(job, vm, "job reported no phases for VM");
        }
        Ok(records)
    }

    /// Traces for every VM in `vms`.
    pub fn fetch_all(
        &mut self,
        job: &str,
        vms: &[VmId],
    ) -> Result<BTreeMap<VmId, Vec<PhaseRecord>>> {
        vms.iter()
            .map(|vm| Ok((vm.clone(), self.fetch(job, vm)?)))
            .collect()
    }
}
