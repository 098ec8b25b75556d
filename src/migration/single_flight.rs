//! Keyed single-flight coordination
//!
//! Schema-namespace creation must happen at most once per namespace even when
//! several pool connections initialize concurrently: the first caller runs
//! the creation, concurrent callers await that same outcome, and a failure is
//! propagated to every caller that was waiting on the failed attempt. A call
//! arriving after a failed attempt starts a fresh one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct FlightState {
    completed: bool,
    /// Attempt number and message of the most recent failure
    last_failure: Option<(u64, String)>,
}

#[derive(Default)]
struct Flight {
    /// Count of finished attempts, readable without taking `state`.
    /// Snapshotting this before blocking on the lock is what distinguishes
    /// "was waiting while the attempt ran" from "arrived after it failed".
    finished: AtomicU64,
    state: Mutex<FlightState>,
}

/// Single-flight runner keyed by string
#[derive(Default)]
pub struct SingleFlight {
    entries: Mutex<HashMap<String, Arc<Flight>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `init` for `key` at most once.
    ///
    /// Callers that arrive while an attempt is in flight wait for it; if that
    /// attempt fails they receive its error rather than retrying themselves.
    /// Callers that arrive after a failure run a fresh attempt.
    pub async fn run<F, Fut>(&self, key: &str, init: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let flight = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Flight::default()))
                .clone()
        };

        let seen_finished = flight.finished.load(Ordering::Acquire);

        let mut state = flight.state.lock().await;
        if state.completed {
            return Ok(());
        }
        if let Some((attempt, message)) = &state.last_failure {
            // failed after we arrived: we were logically waiting on it
            if *attempt > seen_finished {
                return Err(message.clone());
            }
        }

        let outcome = init().await;
        let attempt = flight.finished.fetch_add(1, Ordering::AcqRel) + 1;
        match outcome {
            Ok(()) => {
                state.completed = true;
                state.last_failure = None;
                Ok(())
            }
            Err(message) => {
                state.last_failure = Some((attempt, message.clone()));
                Err(message)
            }
        }
    }

    /// Whether `key` has already completed successfully
    pub async fn is_completed(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(flight) => flight.state.lock().await.completed,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_runs_once_for_concurrent_callers() {
        let flight = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("ns", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_completed("ns").await);
    }

    #[tokio::test]
    async fn test_failure_propagates_then_allows_fresh_attempt() {
        let flight = SingleFlight::new();
        let calls = AtomicU32::new(0);

        let first = flight
            .run("ns", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await;
        assert_eq!(first.unwrap_err(), "boom");

        // A later call retries instead of replaying the stale failure
        let second = flight
            .run("ns", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_receive_in_flight_failure() {
        let flight = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        // All tasks arrive before the leader's attempt finishes, so every
        // non-leader receives the leader's error instead of retrying.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                flight
                    .run("ns", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Err("create failed".to_string())
                    })
                    .await
            }));
        }

        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flight.is_completed("ns").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let flight = SingleFlight::new();
        flight
            .run("a", || async { Err("a failed".to_string()) })
            .await
            .unwrap_err();
        flight.run("b", || async { Ok(()) }).await.unwrap();
        assert!(flight.is_completed("b").await);
        assert!(!flight.is_completed("a").await);
    }
}
