use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Last-write-wins guard for a view that fetches from a live backend.
///
/// Each fetch takes a new generation; when it resolves, its result is only
/// kept if no newer fetch was started in the meantime.
#[derive(Debug, Default)]
pub struct LatestRequest {
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket(u64);

impl LatestRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> RequestTicket {
        RequestTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: RequestTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    /// Runs `fetch` and returns its output, or `None` if it was superseded.
    pub async fn run<F, T>(&self, fetch: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let ticket = self.begin();
        let output = fetch.await;
        if self.is_current(ticket) {
            Some(output)
        } else {
            debug!(generation = ticket.0, "discarding superseded fetch");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn newest_ticket_is_current() {
        let guard = LatestRequest::new();
        let first = guard.begin();
        assert!(guard.is_current(first));
        let second = guard.begin();
        assert!(!guard.is_current(first));
        assert!(guard.is_current(second));
    }

    #[tokio::test]
    async fn slow_superseded_fetch_is_discarded() {
        let guard = LatestRequest::new();
        let slow = guard.run(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "grade=Grade 5"
        });
        let fast = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            guard.run(async { "grade=Grade 6" }).await
        };
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow, None);
        assert_eq!(fast, Some("grade=Grade 6"));
    }

    #[tokio::test]
    async fn lone_fetch_is_kept() {
        let guard = LatestRequest::new();
        assert_eq!(guard.run(async { 3 }).await, Some(3));
        assert_eq!(guard.run(async { 4 }).await, Some(4));
    }
}
