//! Test Failover clone lifecycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DrError, Result};

/// Lifecycle state of a Test Failover clone.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    #[default]
    NotStarted,
    CloneCreated,
    Booted,
    Validated,
    Expired,
}

impl CloneState {
    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: CloneState) -> bool {
        use CloneState::*;
        matches!(
            (self, next),
            (NotStarted, CloneCreated)
                | (CloneCreated, Booted)
                | (Booted, Validated)
                | (CloneCreated | Booted | Validated, Expired)
        )
    }
}

/// Disposable clone of the destination VM created by a Test Failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CloneVm {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub state: CloneState,
}

impl CloneVm {
    /// A clone that the Test Failover job has not created yet.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
            state: CloneState::NotStarted,
        }
    }

    pub fn state(&self) -> CloneState {
        self.state
    }

    /// Start over for a new Test Failover run; the job recreates the clone
    /// under the same name.
    pub fn reset(&mut self) {
        if self.state != CloneState::NotStarted {
            tracing::debug!(clone = %self.name, from = ?self.state, "clone reset for new run");
        }
        self.state = CloneState::NotStarted;
    }

    /// Record a teardown confirmed by the resource query for a clone whose
    /// earlier states were not observed by this run.
    pub fn mark_expired(&mut self) {
        tracing::debug!(clone = %self.name, from = ?self.state, "clone teardown confirmed");
        self.state = CloneState::Expired;
    }

    /// Move to `next`, rejecting steps outside the lifecycle.
    pub fn transition(&mut self, next: CloneState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(DrError::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(clone = %self.name, from = ?self.state, to = ?next, "clone state changed");
        self.state = next;
        Ok(())
    }
}
