//! Sliding one-minute request window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::permission::RequestTicket;
use crate::clock::MINUTE_MS;

/// Tickets are unique across every window in the process.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// One admitted request inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub ticket: RequestTicket,
    /// Admission time, epoch milliseconds
    pub timestamp_ms: i64,
    /// Estimated tokens until the request completes, actual tokens after
    pub tokens: u64,
}

/// Requests admitted during the trailing 60 seconds, oldest first.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    records: VecDeque<RequestRecord>,
    tokens: u64,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop records that are 60 seconds old or older. Returns how many were dropped.
    pub fn evict(&mut self, now_ms: i64) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.records.front() {
            if now_ms - front.timestamp_ms < MINUTE_MS {
                break;
            }
            self.tokens = self.tokens.saturating_sub(front.tokens);
            self.records.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Record an admitted request and hand back its ticket.
    pub fn push(&mut self, now_ms: i64, tokens: u64) -> RequestTicket {
        let ticket = RequestTicket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed));
        self.records.push_back(RequestRecord {
            ticket,
            timestamp_ms: now_ms,
            tokens,
        });
        self.tokens = self.tokens.saturating_add(tokens);
        ticket
    }

    /// Replace the estimate of the given request with its actual token count.
    ///
    /// Returns the signed correction, or `None` if the record already left the window.
    pub fn reconcile(&mut self, ticket: RequestTicket, actual_tokens: u64) -> Option<i64> {
        let record = self.records.iter_mut().rev().find(|r| r.ticket == ticket)?;
        Some(Self::apply(&mut self.tokens, record, actual_tokens))
    }

    /// Reconcile against the most recently admitted request.
    pub fn reconcile_last(&mut self, actual_tokens: u64) -> Option<i64> {
        let record = self.records.back_mut()?;
        Some(Self::apply(&mut self.tokens, record, actual_tokens))
    }

    fn apply(total: &mut u64, record: &mut RequestRecord, actual_tokens: u64) -> i64 {
        let delta = (i128::from(actual_tokens) - i128::from(record.tokens))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        *total = total.saturating_sub(record.tokens).saturating_add(actual_tokens);
        record.tokens = actual_tokens;
        delta
    }

    /// Number of requests in the window.
    pub fn request_count(&self) -> u64 {
        self.records.len() as u64
    }

    /// Tokens attributed to requests in the window.
    pub fn token_count(&self) -> u64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_counts_requests_and_tokens() {
        let mut window = SlidingWindow::new();
        window.push(0, 100);
        window.push(10, 250);

        assert_eq!(window.request_count(), 2);
        assert_eq!(window.token_count(), 350);
    }

    #[test]
    fn test_evict_drops_only_expired_records() {
        let mut window = SlidingWindow::new();
        window.push(0, 100);
        window.push(30_000, 200);

        assert_eq!(window.evict(59_999), 0);
        assert_eq!(window.evict(60_000), 1);
        assert_eq!(window.request_count(), 1);
        assert_eq!(window.token_count(), 200);

        assert_eq!(window.evict(120_000), 1);
        assert_eq!(window.request_count(), 0);
        assert_eq!(window.token_count(), 0);
    }

    #[test]
    fn test_reconcile_by_ticket() {
        let mut window = SlidingWindow::new();
        let first = window.push(0, 500);
        let _second = window.push(5, 500);

        // First request finishes after the second was admitted
        assert_eq!(window.reconcile(first, 800), Some(300));
        assert_eq!(window.token_count(), 1_300);
    }

    #[test]
    fn test_reconcile_last() {
        let mut window = SlidingWindow::new();
        window.push(0, 500);
        window.push(5, 500);

        assert_eq!(window.reconcile_last(200), Some(-300));
        assert_eq!(window.token_count(), 700);
    }

    #[test]
    fn test_reconcile_saturates_on_huge_counts() {
        let mut window = SlidingWindow::new();
        window.push(0, u64::MAX - 10);
        let ticket = window.push(1, 100);
        assert_eq!(window.token_count(), u64::MAX);

        assert_eq!(window.reconcile(ticket, u64::MAX), Some(i64::MAX));
        assert_eq!(window.token_count(), u64::MAX);

        assert_eq!(window.reconcile_last(0), Some(i64::MIN));
        assert_eq!(window.evict(60_000), 1);
        assert_eq!(window.token_count(), 0);
    }

    #[test]
    fn test_reconcile_after_eviction() {
        let mut window = SlidingWindow::new();
        let ticket = window.push(0, 500);
        window.evict(60_000);

        assert_eq!(window.reconcile(ticket, 800), None);
        assert_eq!(window.reconcile_last(800), None);
        assert_eq!(window.token_count(), 0);
    }

    #[test]
    fn test_tickets_are_unique_across_windows() {
        let mut first = SlidingWindow::new();
        let mut second = SlidingWindow::new();
        let a = first.push(0, 1);
        let b = second.push(0, 1);
        assert_ne!(a, b);

        // A foreign ticket never matches
        assert_eq!(second.reconcile(a, 10), None);
        assert_eq!(second.token_count(), 1);
    }
}
