//! Durable admission ledger for lifecycle events.
//!
//! The ledger lives inside the job record, so it is persisted (and
//! compare-and-swapped) together with the state it guards:
//! - **physical duplicates**: a bounded FIFO window of recently seen delivery tokens
//! - **logical duplicates**: the set of event kinds already consumed by the job

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::event::{EventKind, LifecycleEvent};
use crate::id::DeliveryToken;

/// Default number of delivery tokens remembered per job.
pub const DEFAULT_TOKEN_WINDOW: usize = 32;

/// Outcome of screening an event against the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accept,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLedger {
    consumed: BTreeSet<EventKind>,
    recent_tokens: VecDeque<DeliveryToken>,
    window: usize,
}

impl Default for AdmissionLedger {
    fn default() -> Self {
        Self::with_window(DEFAULT_TOKEN_WINDOW)
    }
}

impl AdmissionLedger {
    pub fn with_window(window: usize) -> Self {
        Self {
            consumed: BTreeSet::new(),
            recent_tokens: VecDeque::new(),
            window: window.max(1),
        }
    }

    /// Screen an event without recording it.
    pub fn check(&self, event: &LifecycleEvent) -> Admission {
        if self.consumed.contains(&event.kind) || self.recent_tokens.contains(&event.delivery_token)
        {
            Admission::Duplicate
        } else {
            Admission::Accept
        }
    }

    /// Record an event as consumed.
    ///
    /// Only called for events whose transition is being committed.
    pub fn record(&mut self, event: &LifecycleEvent) {
        self.consumed.insert(event.kind);
        if !self.recent_tokens.contains(&event.delivery_token) {
            self.recent_tokens.push_back(event.delivery_token.clone());
        }
        while self.recent_tokens.len() > self.window {
            self.recent_tokens.pop_front();
        }
    }

    pub fn has_consumed(&self, kind: EventKind) -> bool {
        self.consumed.contains(&kind)
    }

    pub fn remembered_tokens(&self) -> usize {
        self.recent_tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ComputeUnitHandle;
    use crate::id::{ComputeUnitId, JobId};

    fn completion(job_id: JobId, token: &str) -> LifecycleEvent {
        LifecycleEvent::completion(
            ComputeUnitHandle::new(ComputeUnitId::new("unit"), job_id),
            DeliveryToken::new(token),
        )
    }

    #[test]
    fn same_kind_is_a_logical_duplicate_even_with_a_new_token() {
        let job_id = JobId::new();
        let mut ledger = AdmissionLedger::default();

        let first = completion(job_id, "a");
        assert_eq!(ledger.check(&first), Admission::Accept);
        ledger.record(&first);

        assert_eq!(ledger.check(&first), Admission::Duplicate);
        assert_eq!(ledger.check(&completion(job_id, "b")), Admission::Duplicate);
    }

    #[test]
    fn seen_token_is_a_physical_duplicate_for_any_kind() {
        let job_id = JobId::new();
        let mut ledger = AdmissionLedger::default();
        ledger.record(&completion(job_id, "tok"));

        let mut other_kind = completion(job_id, "tok");
        other_kind.kind = EventKind::FailureSignaled;
        assert_eq!(ledger.check(&other_kind), Admission::Duplicate);
    }

    #[test]
    fn token_window_is_bounded() {
        let job_id = JobId::new();
        let mut ledger = AdmissionLedger::with_window(2);

        for (kind, token) in [
            (EventKind::ProvisionRequested, "t1"),
            (EventKind::ProvisionAcked, "t2"),
            (EventKind::CompletionSignaled, "t3"),
        ] {
            let mut event = completion(job_id, token);
            event.kind = kind;
            ledger.record(&event);
        }

        assert_eq!(ledger.remembered_tokens(), 2);
        let mut evicted = completion(job_id, "t1");
        evicted.kind = EventKind::FailureSignaled;
        assert_eq!(ledger.check(&evicted), Admission::Accept);
    }
}
