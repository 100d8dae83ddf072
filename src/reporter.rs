use std::collections::BTreeMap;

use crate::events::Event;
use crate::journal::{JournalEntry, JournalWriter};

/// Reporter aggregates events and produces human or JSON output.
pub struct Reporter {
    events: Vec<Event>,
    json_mode: bool,
    journal: Option<JournalWriter>,
    drill_id: uuid::Uuid,
}

impl Reporter {
    pub fn new(json_mode: bool) -> Self {
        Self {
            events: Vec::new(),
            json_mode,
            journal: None,
            drill_id: uuid::Uuid::nil(),
        }
    }

    /// Also append every event to an NDJSON journal.
    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn record(&mut self, event: Event) {
        if let Event::DrillStarted { drill_id, .. } = &event {
            self.drill_id = *drill_id;
        }
        if self.json_mode {
            // Emit JSON line to stdout
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
        if let Some(journal) = self.journal.as_mut()
            && let Err(e) = journal.write(&JournalEntry::from_event(self.drill_id, &event))
        {
            tracing::warn!(error = %e, "failed to append journal entry");
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Pairs that passed every stage, and the failure recorded for the others.
    pub fn outcomes(&self) -> BTreeMap<&str, Option<&Event>> {
        let mut outcomes = BTreeMap::new();
        for event in &self.events {
            match event {
                Event::PairBuilt { source_vm, .. } => {
                    outcomes.entry(source_vm.as_str()).or_insert(None);
                }
                Event::PairFailed { source_vm, .. } => {
                    outcomes.insert(source_vm.as_str(), Some(event));
                }
                _ => {}
            }
        }
        outcomes
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for event in &self.events {
            match event {
                Event::DrillStarted {
                    operation,
                    source_vms,
                    ..
                } => lines.push(format!("{operation} on {} VM(s)", source_vms.len())),
                Event::JobFinished { job_id, state } => lines.push(format!("job {job_id}: {state}")),
                Event::DrillAborted { stage, error, .. } => {
                    lines.push(format!("aborted at {stage}: {error}"))
                }
                _ => {}
            }
        }
        for (vm, failure) in self.outcomes() {
            match failure {
                Some(Event::PairFailed { stage, error, .. }) => {
                    lines.push(format!("  FAIL {vm} at {stage}: {error}"))
                }
                _ if self.completed() => lines.push(format!("  ok   {vm}")),
                _ => lines.push(format!("  --   {vm}")),
            }
        }
        lines.join("\n")
    }

    fn completed(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, Event::DrillCompleted { .. }))
    }
}
