//! Operation controller: drives one request through its lifecycle.
//!
//! build pairs -> pre-validate -> settle -> trigger job -> wait -> fetch
//! traces -> post-validate. The settle delay runs once per batch and only
//! when a continuous pair remains. Every pair-level stage honours the
//! request's failure policy; with the `parallel` feature the pairs of a
//! stage are checked on a rayon pool.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::{JobService, OperationContext};
use crate::catalog::Catalog;
use crate::clone::CloneState;
use crate::error::{BatchFailure, DrError, PairFailure, Result, Stage};
use crate::events::Event;
use crate::model::{
    DrillOptions, FailurePolicy, JobId, OperationRequest, OperationType, VariantKey, VmId,
};
use crate::pairs::{self, VmPair};
use crate::preflight;
use crate::reporter::Reporter;
use crate::settle::Settle;
use crate::strategy::StrategyRegistry;
use crate::tracer::PhaseTracer;
use crate::validate::{self, PostMode, PostOptions};

/// Upper bound on the default worker count.
#[cfg(feature = "parallel")]
const MAX_DEFAULT_WORKERS: usize = 8;

/// Outcome of a request in which every pair passed.
#[derive(Debug, Clone, Serialize)]
pub struct DrillReport {
    pub drill_id: Uuid,
    pub operation: OperationType,
    /// `None` when no job was triggered (clone expiration checks).
    pub job_id: Option<JobId>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub pairs: Vec<PairReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub source_vm: VmId,
    pub destination_vm: VmId,
    pub variant: VariantKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_state: Option<CloneState>,
}

pub struct Controller<'a> {
    ctx: &'a dyn OperationContext,
    jobs: &'a dyn JobService,
    settle: &'a dyn Settle,
    catalog: Catalog,
    strategies: StrategyRegistry,
}

impl<'a> Controller<'a> {
    /// Controller with the built-in catalog and strategies.
    pub fn new(
        ctx: &'a dyn OperationContext,
        jobs: &'a dyn JobService,
        settle: &'a dyn Settle,
    ) -> Self {
        Self {
            ctx,
            jobs,
            settle,
            catalog: Catalog::builtin(),
            strategies: StrategyRegistry::builtin(),
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run `request` to completion.
    ///
    /// Under the fail-fast policy the first failing pair's error is
    /// returned as is. Under the aggregate policy failing pairs drop out of
    /// later stages and all failures come back as one `DrError::Batch`.
    pub fn run(&self, request: &OperationRequest, reporter: &mut Reporter) -> Result<DrillReport> {
        let drill_id = Uuid::new_v4();
        let started = Utc::now();
        let op = request.operation;
        reporter.record(Event::DrillStarted {
            drill_id,
            operation: op,
            source_vms: request.source_vms.clone(),
        });
        tracing::info!(%drill_id, operation = %op, vms = request.source_vms.len(), "drill started");

        let build = || -> Result<_> {
            request.validate()?;
            let catalog = self.catalog_for(request)?;
            let pairs = pairs::build(op, &request.source_vms, self.ctx, &catalog, &self.strategies)?;
            Ok((catalog, pairs))
        };
        let (catalog, mut pairs) = build().map_err(|e| abort(reporter, drill_id, Stage::Build, e))?;
        for pair in pairs.values() {
            reporter.record(Event::PairBuilt {
                source_vm: pair.source_vm.clone(),
                destination_vm: pair.destination_vm.clone(),
                variant: pair.variant,
            });
        }

        let strategy = self
            .strategies
            .get(op)
            .map_err(|e| abort(reporter, drill_id, Stage::Build, e))?;
        let options = &request.options;
        let mut failures = Vec::new();
        let mut job_id = None;

        if options.post_expiration {
            let post = PostOptions {
                mode: PostMode::Expiration,
                ..PostOptions::default()
            };
            self.run_stage(
                Stage::PostValidate,
                &mut pairs,
                &mut failures,
                options,
                reporter,
                |pair| validate::post_validate(pair, &[], &catalog, strategy, &post),
                |pair| Event::CloneExpired {
                    source_vm: pair.source_vm.clone(),
                    clone: pair.clone.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
                },
            )
            .map_err(|e| abort(reporter, drill_id, Stage::PostValidate, e))?;
        } else {
            let delay = options
                .settle_delay()
                .map_err(|e| abort(reporter, drill_id, Stage::PreValidate, e))?;
            self.run_stage(
                Stage::PreValidate,
                &mut pairs,
                &mut failures,
                options,
                reporter,
                |pair| preflight::pre_validate(pair, strategy),
                |pair| Event::PairPreValidated {
                    source_vm: pair.source_vm.clone(),
                },
            )
            .map_err(|e| abort(reporter, drill_id, Stage::PreValidate, e))?;

            let active = remaining(&pairs, &failures);
            if active
                .iter()
                .filter_map(|vm| pairs.get(vm))
                .any(|p| p.variant.continuous)
            {
                tracing::info!(delay = %humantime::format_duration(delay), "settling continuous pairs");
                self.settle
                    .settle(delay)
                    .map_err(|e| abort(reporter, drill_id, Stage::PreValidate, e))?;
            }
            if !active.is_empty() {
                let id = self
                    .trigger(op, &active, reporter)
                    .map_err(|e| abort(reporter, drill_id, Stage::Trigger, e))?;

                let needs_blobs = active
                    .iter()
                    .filter_map(|vm| pairs.get(vm))
                    .any(|p| strategy.expectations(&p.variant).blobs_retained);
                let fetch = || -> Result<_> {
                    let blobs_retained = if needs_blobs {
                        Some(self.jobs.blobs_retained(&id)?)
                    } else {
                        None
                    };
                    let traces = PhaseTracer::new(self.jobs).fetch_all(&id, &active)?;
                    Ok((blobs_retained, traces))
                };
                let (blobs_retained, traces) =
                    fetch().map_err(|e| abort(reporter, drill_id, Stage::Trace, e))?;
                for (vm, trace) in &traces {
                    reporter.record(Event::TraceFetched {
                        source_vm: vm.clone(),
                        phases: trace.len(),
                    });
                }

                let post = PostOptions {
                    mode: PostMode::Normal,
                    job_id: Some(id.clone()),
                    full_replication: options.full_replication,
                    blobs_retained,
                };
                self.run_stage(
                    Stage::PostValidate,
                    &mut pairs,
                    &mut failures,
                    options,
                    reporter,
                    |pair| {
                        let trace = traces
                            .get(&pair.source_vm)
                            .map(Vec::as_slice)
                            .unwrap_or_default();
                        validate::post_validate(pair, trace, &catalog, strategy, &post)
                    },
                    |pair| Event::PairValidated {
                        source_vm: pair.source_vm.clone(),
                    },
                )
                .map_err(|e| abort(reporter, drill_id, Stage::PostValidate, e))?;
                job_id = Some(id);
            }
        }

        let failed = failures.len();
        reporter.record(Event::DrillCompleted {
            drill_id,
            passed: pairs.len() - failed,
            failed,
        });
        if !failures.is_empty() {
            tracing::warn!(%drill_id, failed, "drill finished with failing pairs");
            return Err(BatchFailure { failures }.into());
        }
        tracing::info!(%drill_id, pairs = pairs.len(), "drill passed");
        Ok(DrillReport {
            drill_id,
            operation: op,
            job_id,
            started,
            finished: Utc::now(),
            pairs: pairs
                .into_values()
                .map(|p| PairReport {
                    clone_state: p.clone.as_ref().map(|c| c.state()),
                    source_vm: p.source_vm,
                    destination_vm: p.destination_vm,
                    variant: p.variant,
                })
                .collect(),
        })
    }

    fn catalog_for(&self, request: &OperationRequest) -> Result<Cow<'_, Catalog>> {
        if request.catalog_overrides.is_empty() {
            return Ok(Cow::Borrowed(&self.catalog));
        }
        let mut catalog = self.catalog.clone();
        catalog.apply_overrides(&request.catalog_overrides)?;
        Ok(Cow::Owned(catalog))
    }

    fn trigger(&self, op: OperationType, vms: &[VmId], reporter: &mut Reporter) -> Result<JobId> {
        let id = self.jobs.trigger(op, vms)?;
        reporter.record(Event::JobTriggered {
            job_id: id.clone(),
            source_vms: vms.to_vec(),
        });
        tracing::info!(job = %id, operation = %op, "job triggered");

        let state = self.jobs.wait(&id)?;
        reporter.record(Event::JobFinished {
            job_id: id.clone(),
            state,
        });
        if !state.is_success() {
            return Err(DrError::JobFailed { job_id: id, state });
        }
        Ok(id)
    }

    /// Run `check` on every pair that has not failed yet.
    #[allow(clippy::too_many_arguments)]
    fn run_stage<F>(
        &self,
        stage: Stage,
        pairs: &mut BTreeMap<VmId, VmPair>,
        failures: &mut Vec<PairFailure>,
        options: &DrillOptions,
        reporter: &mut Reporter,
        check: F,
        passed: fn(&VmPair) -> Event,
    ) -> Result<()>
    where
        F: Fn(&mut VmPair) -> Result<()> + Send + Sync,
    {
        let failed: BTreeSet<&str> = failures.iter().map(|f| f.source_vm.as_str()).collect();
        let mut active: Vec<&mut VmPair> = pairs
            .values_mut()
            .filter(|p| !failed.contains(p.source_vm.as_str()))
            .collect();
        let results = check_pairs(&mut active, options, &check)?;

        for (pair, result) in active.iter().zip(results) {
            match result {
                Ok(()) => reporter.record(passed(pair)),
                Err(error) => {
                    tracing::warn!(source = %pair.source_vm, %stage, error = %error, "pair failed");
                    reporter.record(Event::PairFailed {
                        source_vm: pair.source_vm.clone(),
                        stage,
                        error: error.to_string(),
                    });
                    match options.failure_policy {
                        FailurePolicy::FailFast => return Err(error),
                        FailurePolicy::Aggregate => failures.push(PairFailure {
                            source_vm: pair.source_vm.clone(),
                            stage,
                            error,
                        }),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(not(feature = "parallel"))]
fn check_pairs<F>(
    pairs: &mut [&mut VmPair],
    options: &DrillOptions,
    check: &F,
) -> Result<Vec<Result<()>>>
where
    F: Fn(&mut VmPair) -> Result<()> + Send + Sync,
{
    let mut results = Vec::with_capacity(pairs.len());
    for pair in pairs.iter_mut() {
        let result = check(pair);
        let stop = result.is_err() && options.failure_policy == FailurePolicy::FailFast;
        results.push(result);
        if stop {
            break;
        }
    }
    Ok(results)
}

#[cfg(feature = "parallel")]
fn check_pairs<F>(
    pairs: &mut [&mut VmPair],
    options: &DrillOptions,
    check: &F,
) -> Result<Vec<Result<()>>>
where
    F: Fn(&mut VmPair) -> Result<()> + Send + Sync,
{
    use rayon::prelude::*;

    let workers = options
        .workers
        .unwrap_or_else(|| pairs.len().clamp(1, MAX_DEFAULT_WORKERS));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| DrError::External(format!("failed to start worker pool: {e}")))?;
    Ok(pool.install(|| pairs.par_iter_mut().map(|pair| check(pair)).collect()))
}

fn remaining(pairs: &BTreeMap<VmId, VmPair>, failures: &[PairFailure]) -> Vec<VmId> {
    pairs
        .keys()
        .filter(|vm| !failures.iter().any(|f| &f.source_vm == *vm))
        .cloned()
        .collect()
}

fn abort(reporter: &mut Reporter, drill_id: Uuid, stage: Stage, error: DrError) -> DrError {
    tracing::error!(%drill_id, %stage, error = %error, "drill aborted");
    reporter.record(Event::DrillAborted {
        drill_id,
        stage,
        error: error.to_string(),
    });
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::clone::CloneVm;
    use crate::error::ErrorClass;
    use crate::model::{
        CatalogOverride, FailoverStatus, HypervisorKind, JobState, PhaseName, PhaseRecord,
        PhaseSet, SyncStatus,
    };
    use crate::settle::CancellableSettle;
    use crate::testing::{synthetic_trace, MockContext, MockHandle, MockJobs, RecordingSettle};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn entry(op: OperationType) -> CatalogEntry {
        Catalog::builtin()
            .entry(op, &VariantKey::periodic(HypervisorKind::Vmware))
            .unwrap()
            .clone()
    }

    fn request(op: OperationType, vms: &[&str]) -> OperationRequest {
        OperationRequest::new(op, vms.iter().map(|v| v.to_string()).collect())
    }

    fn run(
        ctx: &MockContext,
        jobs: &MockJobs,
        request: &OperationRequest,
    ) -> (Result<DrillReport>, Reporter) {
        let settle = CancellableSettle::new();
        let controller = Controller::new(ctx, jobs, &settle);
        let mut reporter = Reporter::new(false);
        let result = controller.run(request, &mut reporter);
        (result, reporter)
    }

    #[test]
    fn test_planned_failover_of_two_pairs_passes() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1", "vm2"]);
        let trace = synthetic_trace(&entry(OperationType::PlannedFailover));
        let jobs = MockJobs::new("1001")
            .with_trace("vm1", trace.clone())
            .with_trace("vm2", trace);
        let (result, reporter) = run(
            &ctx,
            &jobs,
            &request(OperationType::PlannedFailover, &["vm1", "vm2"]),
        );

        let report = result.unwrap();
        assert_eq!(report.job_id.as_deref(), Some("1001"));
        assert_eq!(report.pairs.len(), 2);
        assert_eq!(
            jobs.triggered(),
            vec![(
                OperationType::PlannedFailover,
                vec!["vm1".to_string(), "vm2".to_string()]
            )]
        );
        assert_eq!(jobs.phase_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            reporter.events().last(),
            Some(Event::DrillCompleted {
                passed: 2,
                failed: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_fail_fast_returns_first_error() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1", "vm2"]);
        let jobs = MockJobs::new("1001").with_trace(
            "vm1",
            synthetic_trace(&entry(OperationType::PlannedFailover)),
        );
        let (result, reporter) = run(
            &ctx,
            &jobs,
            &request(OperationType::PlannedFailover, &["vm1", "vm2"]),
        );
        assert!(matches!(result, Err(DrError::PhaseNotFound { ref vm, .. }) if vm == "vm2"));
        assert!(matches!(
            reporter.events().last(),
            Some(Event::DrillAborted {
                stage: Stage::PostValidate,
                ..
            })
        ));
    }

    #[test]
    fn test_aggregate_excludes_failed_pairs_from_trigger() {
        let ctx = MockContext::new("vmware")
            .with_pairs(&["vm1", "vm2"])
            .with_handle_for(
                "vm2",
                MockHandle::default().with_status(SyncStatus::NeedsSync, FailoverStatus::None),
            );
        let jobs = MockJobs::new("1002").with_trace(
            "vm1",
            synthetic_trace(&entry(OperationType::TestFailover)),
        );
        let mut req = request(OperationType::TestFailover, &["vm1", "vm2"]);
        req.options.failure_policy = FailurePolicy::Aggregate;
        let (result, reporter) = run(&ctx, &jobs, &req);

        assert_eq!(
            jobs.triggered(),
            vec![(OperationType::TestFailover, vec!["vm1".to_string()])]
        );
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        let DrError::Batch(batch) = err else {
            panic!("expected batch failure");
        };
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].source_vm, "vm2");
        assert_eq!(batch.failures[0].stage, Stage::PreValidate);
        assert!(
            reporter
                .events()
                .iter()
                .any(|e| matches!(e, Event::PairValidated { source_vm } if source_vm == "vm1"))
        );
    }

    #[test]
    fn test_failed_job_skips_post_validation() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1"]);
        let jobs = MockJobs::new("1003").with_state(JobState::CompletedWithErrors);
        let (result, _) = run(&ctx, &jobs, &request(OperationType::TestFailover, &["vm1"]));
        assert!(matches!(result, Err(DrError::JobFailed { .. })));
        assert_eq!(jobs.phase_calls.load(Ordering::SeqCst), 0);
        assert!(!ctx.log().called("power_state"));
    }

    #[test]
    fn test_unsupported_pair_never_triggers_a_job() {
        let ctx = MockContext::new("hyper-v")
            .with_pairs(&["vm1"])
            .with_failback_support(false);
        let jobs = MockJobs::new("1004");
        let (result, _) = run(&ctx, &jobs, &request(OperationType::Failback, &["vm1"]));
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unsupported);
        assert!(jobs.triggered().is_empty());
    }

    #[test]
    fn test_clone_expiration_runs_no_job() {
        let mut clone = CloneVm::pending("vm1_DR_clone");
        for state in [
            CloneState::CloneCreated,
            CloneState::Booted,
            CloneState::Validated,
        ] {
            clone.transition(state).unwrap();
        }
        let ctx = MockContext::new("vmware")
            .with_pairs(&["vm1"])
            .with_handle(MockHandle::default().with_clone(clone));
        let jobs = MockJobs::new("1005");
        let mut req = request(OperationType::TestFailover, &["vm1"]);
        req.options.post_expiration = true;
        let (result, _) = run(&ctx, &jobs, &req);

        let report = result.unwrap();
        assert_eq!(report.job_id, None);
        assert_eq!(report.pairs[0].clone_state, Some(CloneState::Expired));
        assert!(jobs.triggered().is_empty());
        assert!(!ctx.log().called("add_test_data"));
        assert!(!ctx.log().called("boot"));
    }

    #[test]
    fn test_catalog_override_replaces_expected_phases() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1"]);
        let jobs = MockJobs::new("1006")
            .with_trace("vm1", vec![PhaseRecord::new(PhaseName::Shutdown)]);
        let mut req = request(OperationType::PlannedFailover, &["vm1"]);
        req.catalog_overrides.push(CatalogOverride {
            operation: OperationType::PlannedFailover,
            key: VariantKey::periodic(HypervisorKind::Vmware),
            source: PhaseSet::from([PhaseName::Shutdown]),
            destination: PhaseSet::new(),
            clone: PhaseSet::new(),
        });
        let (result, _) = run(&ctx, &jobs, &req);
        result.unwrap();
    }

    #[test]
    fn test_empty_catalog_and_registry_are_configuration_errors() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1"]);
        let jobs = MockJobs::new("1008");
        let settle = CancellableSettle::new();
        let req = request(OperationType::Failback, &["vm1"]);

        let controller = Controller::new(&ctx, &jobs, &settle).with_catalog(Catalog::new());
        assert!(controller.catalog().is_empty());
        let err = controller.run(&req, &mut Reporter::new(false)).unwrap_err();
        assert!(matches!(err, DrError::MissingCatalogEntry { .. }));

        let controller =
            Controller::new(&ctx, &jobs, &settle).with_strategies(StrategyRegistry::new());
        let err = controller.run(&req, &mut Reporter::new(false)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(jobs.triggered().is_empty());
    }

    #[test]
    fn test_invalid_request_aborts_at_build() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1"]);
        let jobs = MockJobs::new("1007");
        let (result, reporter) = run(&ctx, &jobs, &request(OperationType::TestFailover, &[]));
        assert!(matches!(result, Err(DrError::InvalidConfiguration(_))));
        assert!(matches!(
            reporter.events().last(),
            Some(Event::DrillAborted {
                stage: Stage::Build,
                ..
            })
        ));
    }

    #[test]
    fn test_continuous_batch_settles_once() {
        let ctx = MockContext::new("vmware")
            .with_pairs(&["vm1", "vm2", "vm3"])
            .with_handle(MockHandle::default().continuous());
        let jobs = MockJobs::new("1009");
        let settle = RecordingSettle::default();
        let mut reporter = Reporter::new(false);
        let report = Controller::new(&ctx, &jobs, &settle)
            .run(
                &request(OperationType::UnplannedFailover, &["vm1", "vm2", "vm3"]),
                &mut reporter,
            )
            .unwrap();

        assert_eq!(settle.waits(), vec![Duration::from_secs(120)]);
        assert_eq!(report.pairs.len(), 3);
        assert!(report.pairs.iter().all(|p| p.variant.continuous));

        let calls = ctx.log().calls();
        let seeds = calls
            .iter()
            .filter(|c| c.as_str() == "failover:add_test_data(true)")
            .count();
        assert_eq!(seeds, 3);
        // journal replication: no sub-jobs, seeded data reaches the destination
        assert!(!ctx.log().called("backup_job"));
        assert!(!ctx.log().called("replication_job"));
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.as_str() == "failover:test_data(false)")
                .count(),
            3
        );
        assert!(matches!(
            reporter.events().last(),
            Some(Event::DrillCompleted {
                passed: 3,
                failed: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_periodic_batch_does_not_settle() {
        let ctx = MockContext::new("vmware").with_pairs(&["vm1"]);
        let jobs = MockJobs::new("1010").with_trace(
            "vm1",
            synthetic_trace(&entry(OperationType::PlannedFailover)),
        );
        let settle = RecordingSettle::default();
        Controller::new(&ctx, &jobs, &settle)
            .run(
                &request(OperationType::PlannedFailover, &["vm1"]),
                &mut Reporter::new(false),
            )
            .unwrap();
        assert!(settle.waits().is_empty());
        assert!(ctx.log().called("backups_synced(1010)"));
    }
}
