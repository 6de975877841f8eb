//! Isolated sandbox execution for verification (spec.md §4.5).
//!
//! The checks in this crate are pure functions over byte snapshots — they
//! never touch a live VFS handle, the network, or the process environment,
//! so isolation reduces to two guarantees: (1) callers pass byte snapshots,
//! never live handles, and (2) a wall-clock timeout bounds every run. A
//! host that wants true OS-level isolation (a separate process, a WASM
//! instance) wraps `SandboxRunner::run` accordingly — this type is the
//! contract boundary, generalized from the teacher's `sandbox.rs`
//! `SandboxProfile` (external `srt` binary) to an in-process timeout
//! contract, per spec.md §1's note that the isolation mechanism is an
//! implementation choice.

use std::time::Duration;

use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOutcome<T> {
    Completed(T),
    TimedOut,
}

pub struct SandboxRunner {
    pub timeout: Duration,
}

impl SandboxRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs a synchronous check function under a wall-clock timeout. The
    /// check receives only the byte snapshot it needs — no filesystem or
    /// network handles are reachable from within it.
    pub async fn run<F, T>(&self, events: &EventBus, check: F) -> SandboxOutcome<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(check)).await {
            Ok(Ok(value)) => SandboxOutcome::Completed(value),
            Ok(Err(_join_error)) => {
                events.emit("verification:worker_crash", serde_json::json!({}));
                SandboxOutcome::TimedOut
            }
            Err(_elapsed) => {
                events.emit("verification:timeout", serde_json::json!({"timeoutMs": self.timeout.as_millis()}));
                SandboxOutcome::TimedOut
            }
        }
    }
}

impl<T> SandboxOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            SandboxOutcome::Completed(v) => Some(v),
            SandboxOutcome::TimedOut => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_timeout() {
        let runner = SandboxRunner::new(Duration::from_millis(500));
        let events = EventBus::new();
        let outcome = runner.run(&events, || 2 + 2).await;
        assert_eq!(outcome.completed(), Some(4));
    }

    #[tokio::test]
    async fn times_out_on_slow_check() {
        let runner = SandboxRunner::new(Duration::from_millis(20));
        let events = EventBus::new();
        let outcome = runner
            .run(&events, || {
                std::thread::sleep(Duration::from_millis(200));
                1
            })
            .await;
        assert_eq!(outcome.completed(), None);
    }
}
