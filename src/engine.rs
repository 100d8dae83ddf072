use anyhow::{Context, Result};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::cli::{CatalogArgs, CheckTraceArgs, ReplayArgs};
use crate::controller::Controller;
use crate::error::DrError;
use crate::exit_codes::{self, exit};
use crate::journal::JournalWriter;
use crate::model::{self, JobTrace, PhaseSet, VmId};
use crate::replay::{self, ReplayBackend};
use crate::reporter::Reporter;
use crate::settle::CancellableSettle;
use crate::validate;

pub fn replay(args: ReplayArgs) -> Result<i32> {
    let mut request = model::load_request(&args.request).context("failed to load request")?;
    if let Some(delay) = args.settle_delay {
        request.options.settle_delay = delay;
    }
    if let Some(policy) = args.failure_policy {
        request.options.failure_policy = policy;
    }
    let recording =
        replay::load_recording(&args.recording).context("failed to load recording")?;
    let backend = ReplayBackend::new(recording);
    let settle = CancellableSettle::new();

    let mut reporter = Reporter::new(args.json);
    if let Some(journal_path) = args.journal {
        reporter = reporter.with_journal(JournalWriter::open(journal_path)?);
    }

    let controller = Controller::new(&backend, &backend, &settle);
    match controller.run(&request, &mut reporter) {
        Ok(report) => {
            if args.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("{}", reporter.summary());
            }
            Ok(exit::SUCCESS)
        }
        Err(e) => {
            if !args.json {
                println!("{}", reporter.summary());
            }
            eprintln!("error: {e}");
            Ok(exit_codes::for_error(&e))
        }
    }
}

pub fn show_catalog(args: CatalogArgs) -> Result<i32> {
    let catalog = Catalog::builtin();
    let key = args.variant.key();
    let entry = catalog.entry(args.operation, &key)?;

    if args.json {
        let value = serde_json::json!({
            "operation": args.operation,
            "key": key,
            "entry": entry,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{} on {key}", args.operation);
        if entry.supported {
            println!("  source:      {}", phase_list(&entry.source));
            println!("  destination: {}", phase_list(&entry.destination));
            if !entry.clone.is_empty() {
                println!("  clone:       {}", phase_list(&entry.clone));
            }
        } else {
            println!("  not supported");
        }
    }
    Ok(if entry.supported {
        exit::SUCCESS
    } else {
        exit::CONFIGURATION_FAILURE
    })
}

/// Per-VM result of a trace check.
#[derive(Serialize)]
struct TraceCheck {
    source_vm: VmId,
    ok: bool,
    matched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn check_trace(args: CheckTraceArgs) -> Result<i32> {
    let content = std::fs::read_to_string(&args.trace)
        .with_context(|| format!("failed to read {}", args.trace.display()))?;
    let trace: JobTrace = serde_json::from_str(&content).context("invalid job trace")?;
    if trace.per_vm.is_empty() {
        return Err(DrError::InvalidConfiguration(format!(
            "job {} has no VM phases",
            trace.job_id
        ))
        .into());
    }

    let catalog = Catalog::builtin();
    let key = args.variant.key();
    let entry = catalog.entry(args.operation, &key)?;
    if !entry.supported {
        return Err(DrError::InvalidConfiguration(format!(
            "{} is not supported on {key}",
            args.operation
        ))
        .into());
    }
    if key.continuous {
        tracing::warn!(%key, "continuous variants expect no phases; every trace matches");
    }

    let checks: Vec<TraceCheck> = trace
        .per_vm
        .iter()
        .map(|(vm, records)| match validate::match_phases(vm, entry, records) {
            Ok(matched) => TraceCheck {
                source_vm: vm.clone(),
                ok: true,
                matched: matched.len(),
                error: None,
            },
            Err(e) => TraceCheck {
                source_vm: vm.clone(),
                ok: false,
                matched: 0,
                error: Some(e.to_string()),
            },
        })
        .collect();

    if args.json {
        for check in &checks {
            println!("{}", serde_json::to_string(check)?);
        }
    } else {
        println!("job {}: {} on {key}", trace.job_id, args.operation);
        for check in &checks {
            match &check.error {
                None => println!("  ok   {} ({} phases)", check.source_vm, check.matched),
                Some(error) => println!("  FAIL {}: {error}", check.source_vm),
            }
        }
    }
    Ok(if checks.iter().all(|c| c.ok) {
        exit::SUCCESS
    } else {
        exit::VALIDATION_FAILURE
    })
}

fn phase_list(phases: &PhaseSet) -> String {
    if phases.is_empty() {
        return "-".to_string();
    }
    phases
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
