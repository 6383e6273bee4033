//! Request outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::pipeline::Outcome;

/// Per-outcome counters shared between the CoAP server and the admin API.
#[derive(Debug, Default)]
pub struct GatewayStats {
    total: AtomicU64,
    outcomes: [AtomicU64; Outcome::COUNT],
    dropped_datagrams: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub accepted: u64,
    pub method_not_allowed: u64,
    pub route_not_found: u64,
    pub malformed_payload: u64,
    pub invalid_payload: u64,
    pub forward_failure: u64,
    pub handler_exception: u64,
    pub dropped_datagrams: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Datagrams that never reached the pipeline because they failed to decode.
    pub fn record_dropped(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            accepted: self.count(Outcome::Accepted),
            method_not_allowed: self.count(Outcome::MethodNotAllowed),
            route_not_found: self.count(Outcome::RouteNotFound),
            malformed_payload: self.count(Outcome::MalformedPayload),
            invalid_payload: self.count(Outcome::InvalidPayload),
            forward_failure: self.count(Outcome::ForwardFailure),
            handler_exception: self.count(Outcome::HandlerException),
            dropped_datagrams: self.dropped_datagrams.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_outcome_separately() {
        let stats = GatewayStats::new();
        stats.record(Outcome::Accepted);
        stats.record(Outcome::Accepted);
        stats.record(Outcome::RouteNotFound);
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.route_not_found, 1);
        assert_eq!(snap.forward_failure, 0);
        assert_eq!(snap.dropped_datagrams, 1);
    }

    #[test]
    fn snapshot_serializes_with_snake_case_keys() {
        let stats = GatewayStats::new();
        stats.record(Outcome::HandlerException);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["handler_exception"], 1);
        assert_eq!(json["total_requests"], 1);
    }
}
