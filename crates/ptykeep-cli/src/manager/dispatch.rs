//! In-flight request tracking for the multiplexed daemon connection.
//!
//! Responses arrive on a shared reader task, interleaved with pushed
//! session events, so request futures can't own the stream. Each request
//! registers here under its id; the reader task completes it when the
//! matching response frame shows up.
//!
//! Timeouts are guarded: an entry transitions to `TimedOut` only if it
//! is still pending when the deadline passes, so a completion racing the
//! deadline always wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use ptykeep_core::error::ApiError;

/// How often a waiter re-checks its deadline when no wakeup arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Terminal state of one tracked request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(ApiError),
    TimedOut,
}

enum Entry<T> {
    Pending { deadline: Instant },
    Done(Outcome<T>),
}

/// Correlates request ids with their eventual outcomes.
pub struct DispatchTable<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    notify: Notify,
}

impl<T: Clone> DispatchTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Track a request. Must be called before the request frame is
    /// written, or a fast response could arrive with nowhere to land.
    pub fn register(&self, id: &str, timeout: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id.to_string(),
            Entry::Pending {
                deadline: Instant::now() + timeout,
            },
        );
    }

    /// Complete a pending request. Returns false if the id is unknown or
    /// already resolved; a response arriving after timeout is dropped.
    pub fn complete(&self, id: &str, value: T) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(id) {
            Some(entry @ Entry::Pending { .. }) => {
                *entry = Entry::Done(Outcome::Completed(value));
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Fail a pending request.
    pub fn fail(&self, id: &str, error: ApiError) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(id) {
            Some(entry @ Entry::Pending { .. }) => {
                *entry = Entry::Done(Outcome::Failed(error));
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Fail every pending request, typically on transport loss.
    pub fn fail_all_pending(&self, error: &ApiError) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut any = false;
        for entry in entries.values_mut() {
            if matches!(entry, Entry::Pending { .. }) {
                *entry = Entry::Done(Outcome::Failed(error.clone()));
                any = true;
            }
        }
        if any {
            self.notify.notify_waiters();
        }
    }

    pub fn pending_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|e| matches!(e, Entry::Pending { .. }))
            .count()
    }

    /// Wait for the request's outcome, consuming the entry.
    ///
    /// The deadline check happens under the lock: if the entry resolved
    /// since the last wakeup, that outcome is returned even when the
    /// deadline has also passed.
    pub async fn await_outcome(&self, id: &str) -> Outcome<T> {
        loop {
            {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                match entries.remove(id) {
                    Some(Entry::Done(outcome)) => return outcome,
                    Some(Entry::Pending { deadline }) => {
                        if Instant::now() >= deadline {
                            return Outcome::TimedOut;
                        }
                        entries.insert(id.to_string(), Entry::Pending { deadline });
                    }
                    None => {
                        return Outcome::Failed(ApiError::internal(format!(
                            "Request '{}' was never registered",
                            id
                        )));
                    }
                }
            }

            // Bounded wait: a missed notification only costs one poll.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

impl<T: Clone> Default for DispatchTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptykeep_core::error::ErrorCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn completion_resolves_waiter() {
        let table = Arc::new(DispatchTable::new());
        table.register("r1", Duration::from_secs(5));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.await_outcome("r1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.complete("r1", 42u32));

        assert_eq!(waiter.await.unwrap(), Outcome::Completed(42));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn completion_before_await_is_not_lost() {
        let table: DispatchTable<u32> = DispatchTable::new();
        table.register("r1", Duration::from_secs(5));
        assert!(table.complete("r1", 7));
        assert_eq!(table.await_outcome("r1").await, Outcome::Completed(7));
    }

    #[tokio::test]
    async fn deadline_times_out_pending_entry() {
        let table: DispatchTable<u32> = DispatchTable::new();
        table.register("slow", Duration::from_millis(80));
        assert_eq!(table.await_outcome("slow").await, Outcome::TimedOut);

        // Late completion finds nothing to resolve.
        assert!(!table.complete("slow", 1));
    }

    #[tokio::test]
    async fn completion_racing_deadline_wins() {
        let table = Arc::new(DispatchTable::new());
        table.register("race", Duration::from_millis(60));
        // Resolve just before the deadline; the waiter must observe the
        // completion, not the timeout.
        let completer = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                table.complete("race", 9u32)
            })
        };

        assert_eq!(table.await_outcome("race").await, Outcome::Completed(9));
        assert!(completer.await.unwrap());
    }

    #[tokio::test]
    async fn fail_all_pending_sweeps_in_flight_requests() {
        let table: DispatchTable<u32> = DispatchTable::new();
        table.register("a", Duration::from_secs(5));
        table.register("b", Duration::from_secs(5));
        table.register("done", Duration::from_secs(5));
        table.complete("done", 1);

        table.fail_all_pending(&ApiError::disconnected("socket closed"));

        for id in ["a", "b"] {
            match table.await_outcome(id).await {
                Outcome::Failed(err) => assert_eq!(err.code, ErrorCode::Disconnected),
                other => panic!("expected failure for {}, got {:?}", id, other),
            }
        }
        // The already-completed entry is untouched.
        assert_eq!(table.await_outcome("done").await, Outcome::Completed(1));
    }

    #[tokio::test]
    async fn unregistered_id_fails_fast() {
        let table: DispatchTable<u32> = DispatchTable::new();
        match table.await_outcome("ghost").await {
            Outcome::Failed(err) => assert_eq!(err.code, ErrorCode::InternalError),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
