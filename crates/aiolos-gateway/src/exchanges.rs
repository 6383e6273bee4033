//! Duplicate detection for inbound CoAP messages.
//!
//! A device that hears nothing back within its ACK timeout retransmits the
//! same Confirmable message (same peer, same message id). Each exchange is
//! remembered for `EXCHANGE_LIFETIME` so a retransmission never starts a
//! second pipeline run: while the first copy is in flight the duplicate is
//! dropped, and once it completed the cached ACK is sent again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// RFC 7252 EXCHANGE_LIFETIME with the default transmission parameters.
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Upper bound on remembered exchanges.
pub const MAX_TRACKED_EXCHANGES: usize = 4096;

pub type ExchangeKey = (SocketAddr, u16);

/// What is known about an inbound message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    /// First copy: the caller owns the exchange and must complete or forget it.
    New,
    /// A copy is still being handled.
    InFlight,
    /// Already answered. Holds the encoded reply when it can be replayed.
    Completed(Option<Bytes>),
}

#[derive(Debug)]
enum State {
    InFlight,
    Completed(Option<Bytes>),
}

#[derive(Debug)]
struct Entry {
    received: Instant,
    state: State,
}

#[derive(Debug)]
pub struct ExchangeCache {
    entries: Mutex<HashMap<ExchangeKey, Entry>>,
    lifetime: Duration,
    capacity: usize,
}

impl Default for ExchangeCache {
    fn default() -> Self {
        Self::new(EXCHANGE_LIFETIME, MAX_TRACKED_EXCHANGES)
    }
}

impl ExchangeCache {
    pub fn new(lifetime: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
            capacity: capacity.max(1),
        }
    }

    /// Look up `key`, registering it as in flight when it is new or expired.
    pub fn begin(&self, key: ExchangeKey, now: Instant) -> Seen {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(&key) {
            if now.duration_since(entry.received) < self.lifetime {
                return match &entry.state {
                    State::InFlight => Seen::InFlight,
                    State::Completed(reply) => Seen::Completed(reply.clone()),
                };
            }
        }

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| now.duration_since(e.received) < self.lifetime);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.received)
                    .map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                received: now,
                state: State::InFlight,
            },
        );
        Seen::New
    }

    /// Record the answer for `key`. `reply` is kept for replay to duplicates.
    pub fn complete(&self, key: ExchangeKey, reply: Option<Bytes>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&key) {
            entry.state = State::Completed(reply);
        }
    }

    /// Drop `key` so the next copy is handled afresh.
    pub fn forget(&self, key: ExchangeKey) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16, mid: u16) -> ExchangeKey {
        (SocketAddr::from(([127, 0, 0, 1], port)), mid)
    }

    #[test]
    fn duplicate_while_in_flight_is_flagged() {
        let cache = ExchangeCache::default();
        let now = Instant::now();

        assert_eq!(cache.begin(key(5000, 7), now), Seen::New);
        assert_eq!(cache.begin(key(5000, 7), now), Seen::InFlight);
    }

    #[test]
    fn completed_reply_is_replayed() {
        let cache = ExchangeCache::default();
        let now = Instant::now();
        let ack = Bytes::from_static(&[0x60, 0x44, 0x00, 0x07]);

        cache.begin(key(5000, 7), now);
        cache.complete(key(5000, 7), Some(ack.clone()));

        assert_eq!(
            cache.begin(key(5000, 7), now + Duration::from_secs(5)),
            Seen::Completed(Some(ack))
        );
    }

    #[test]
    fn same_mid_from_another_peer_is_distinct() {
        let cache = ExchangeCache::default();
        let now = Instant::now();

        assert_eq!(cache.begin(key(5000, 7), now), Seen::New);
        assert_eq!(cache.begin(key(5001, 7), now), Seen::New);
    }

    #[test]
    fn expired_exchange_starts_over() {
        let cache = ExchangeCache::new(Duration::from_secs(10), 16);
        let now = Instant::now();

        cache.begin(key(5000, 7), now);
        cache.complete(key(5000, 7), None);

        assert_eq!(cache.begin(key(5000, 7), now + Duration::from_secs(11)), Seen::New);
    }

    #[test]
    fn forgotten_exchange_starts_over() {
        let cache = ExchangeCache::default();
        let now = Instant::now();

        cache.begin(key(5000, 7), now);
        cache.forget(key(5000, 7));
        assert_eq!(cache.begin(key(5000, 7), now), Seen::New);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ExchangeCache::new(Duration::from_secs(60), 2);
        let start = Instant::now();

        cache.begin(key(5000, 1), start);
        cache.begin(key(5000, 2), start + Duration::from_secs(1));
        cache.begin(key(5000, 3), start + Duration::from_secs(2));

        assert_eq!(cache.len(), 2);
        let later = start + Duration::from_secs(3);
        assert_eq!(cache.begin(key(5000, 2), later), Seen::InFlight);
        assert_eq!(cache.begin(key(5000, 3), later), Seen::InFlight);
    }
}
