// Host-authoritative append-only event log.
//
// Every peer in a room runs the same `Reducer` over the same accepted
// sequence, so all replicas converge on identical state. Only the host
// *decides*: proposed events flow to the host, which validates each against
// its current state, stamps the ones it accepts, and broadcasts them. Other
// peers apply accepted events without re-deciding — if a replica's reducer
// rejects an event the host accepted, the replicas have diverged, and we
// record the violation rather than attempt repair.

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tavern_protocol::types::PlayerId;

/// Deterministic state machine driven by the event log.
///
/// `reduce` either applies the event to the current state or rejects it with
/// a reason, leaving the state untouched. Determinism is the contract: given
/// the same starting state and the same event, every replica must make the
/// same decision.
pub trait Reducer {
    type Event: Clone + Serialize + DeserializeOwned;

    fn reduce(&mut self, event: &Self::Event) -> Result<(), String>;
}

/// An event the host validated and appended, stamped with the host's
/// identity at acceptance time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted<E> {
    pub event: E,
    pub accepted_by: PlayerId,
}

/// The reducer plus the accepted sequence that produced its state.
pub struct EventLog<R: Reducer> {
    reducer: R,
    accepted: Vec<Accepted<R::Event>>,
    violations: u64,
}

impl<R: Reducer> EventLog<R> {
    pub fn new(reducer: R) -> Self {
        Self {
            reducer,
            accepted: Vec::new(),
            violations: 0,
        }
    }

    /// Host path: validate proposed events against current state, stamp and
    /// append the ones that pass. Returns the accepted batch for broadcast.
    /// Rejections are expected (stale or illegal proposals) and only logged
    /// at debug.
    pub fn ingest_requests(
        &mut self,
        events: Vec<R::Event>,
        host: PlayerId,
    ) -> Vec<Accepted<R::Event>> {
        let mut batch = Vec::new();
        for event in events {
            match self.reducer.reduce(&event) {
                Ok(()) => {
                    let accepted = Accepted {
                        event,
                        accepted_by: host,
                    };
                    self.accepted.push(accepted.clone());
                    batch.push(accepted);
                }
                Err(reason) => {
                    debug!("rejected proposed event: {reason}");
                }
            }
        }
        batch
    }

    /// Replica path: apply events the host already accepted. A rejection
    /// here means this replica has diverged from the host; the event is
    /// dropped, the violation counted, and the log keeps going. Returns how
    /// many events were applied.
    pub fn apply_accepted(&mut self, batch: Vec<Accepted<R::Event>>) -> usize {
        let mut applied = 0;
        for accepted in batch {
            match self.reducer.reduce(&accepted.event) {
                Ok(()) => {
                    self.accepted.push(accepted);
                    applied += 1;
                }
                Err(reason) => {
                    self.violations += 1;
                    error!("consistency violation: host-accepted event rejected locally: {reason}");
                }
            }
        }
        applied
    }

    /// Bootstrap from a host's full history. Only legal on an empty log:
    /// applying a history on top of already-applied events would duplicate
    /// them, so a non-empty log refuses the whole batch. Returns the number
    /// of events applied, or `None` if the guard refused.
    pub fn apply_history(&mut self, batch: Vec<Accepted<R::Event>>) -> Option<usize> {
        if !self.accepted.is_empty() {
            error!(
                "refusing history of {} events: log already has {} entries",
                batch.len(),
                self.accepted.len()
            );
            return None;
        }
        Some(self.apply_accepted(batch))
    }

    /// Full accepted sequence, oldest first.
    pub fn history(&self) -> &[Accepted<R::Event>] {
        &self.accepted
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    /// Host-accepted events this replica's reducer rejected. Nonzero means
    /// replicas have diverged.
    pub fn consistency_violations(&self) -> u64 {
        self.violations
    }

    pub fn state(&self) -> &R {
        &self.reducer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Monotonic counter: accepts an increment only if it matches the
    /// expected next value.
    struct Counter {
        value: u32,
    }

    impl Reducer for Counter {
        type Event = u32;

        fn reduce(&mut self, event: &u32) -> Result<(), String> {
            if *event != self.value + 1 {
                return Err(format!("expected {}, got {event}", self.value + 1));
            }
            self.value = *event;
            Ok(())
        }
    }

    fn fresh() -> EventLog<Counter> {
        EventLog::new(Counter { value: 0 })
    }

    #[test]
    fn host_accepts_valid_and_drops_invalid() {
        let mut log = fresh();
        let batch = log.ingest_requests(vec![1, 2, 5, 3], PlayerId(1));
        assert_eq!(batch.len(), 3);
        assert_eq!(log.state().value, 3);
        assert_eq!(log.len(), 3);
        // Host-side rejection is not a violation.
        assert_eq!(log.consistency_violations(), 0);
    }

    #[test]
    fn accepted_events_carry_host_stamp() {
        let mut log = fresh();
        let batch = log.ingest_requests(vec![1], PlayerId(42));
        assert_eq!(batch[0].accepted_by, PlayerId(42));
        assert_eq!(log.history()[0].accepted_by, PlayerId(42));
    }

    #[test]
    fn replica_applies_host_batch() {
        let mut host = fresh();
        let batch = host.ingest_requests(vec![1, 2], PlayerId(1));

        let mut replica = fresh();
        assert_eq!(replica.apply_accepted(batch), 2);
        assert_eq!(replica.state().value, 2);
        assert_eq!(replica.history(), host.history());
    }

    #[test]
    fn replica_rejection_counts_violation_and_continues() {
        let mut replica = fresh();
        let bad = vec![
            Accepted {
                event: 5,
                accepted_by: PlayerId(1),
            },
            Accepted {
                event: 1,
                accepted_by: PlayerId(1),
            },
        ];
        // The impossible jump is dropped; the valid event still applies.
        assert_eq!(replica.apply_accepted(bad), 1);
        assert_eq!(replica.consistency_violations(), 1);
        assert_eq!(replica.state().value, 1);
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn history_bootstraps_empty_log() {
        let mut host = fresh();
        let batch = host.ingest_requests(vec![1, 2, 3], PlayerId(1));

        let mut joiner = fresh();
        assert_eq!(joiner.apply_history(batch), Some(3));
        assert_eq!(joiner.state().value, 3);
    }

    #[test]
    fn history_refused_on_nonempty_log() {
        let mut log = fresh();
        log.ingest_requests(vec![1], PlayerId(1));

        let stale = vec![Accepted {
            event: 1,
            accepted_by: PlayerId(2),
        }];
        assert_eq!(log.apply_history(stale), None);
        // Untouched: still one event, no violations.
        assert_eq!(log.len(), 1);
        assert_eq!(log.consistency_violations(), 0);
    }
}
