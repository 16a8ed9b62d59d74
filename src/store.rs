//! Local key/value store with per-entry expiration and republish deadlines.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::Id;

/// Deadlines that do not fit in an [Instant] are clamped to this far ahead.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    republish_at: Instant,
}

/// A value whose republish deadline passed during a [Store::sweep].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRepublish {
    pub key: Id,
    pub value: Bytes,
    /// Time left until the entry expires.
    pub remaining_ttl: Duration,
}

#[derive(Debug, Default)]
/// Values stored on this node, either put by a client, stored by other peers,
/// or cached from a lookup.
///
/// Reads do not check expiration, entries are only removed by [Store::sweep].
pub struct Store {
    entries: RwLock<HashMap<Id, Entry>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored for `key`, if any.
    pub fn read(&self, key: &Id) -> Option<Bytes> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Store `value` for `key`, replacing any previous entry.
    pub fn write(&self, key: Id, value: Bytes, ttl: Duration, republish_interval: Duration) {
        let now = Instant::now();

        trace!(?key, len = value.len(), ?ttl, "Writing value");

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                Entry {
                    value,
                    expires_at: deadline(now, ttl),
                    republish_at: deadline(now, republish_interval),
                },
            );
    }

    /// Remove expired entries, then collect every remaining entry whose republish
    /// deadline passed and push its deadline `republish_interval` into the future.
    ///
    /// Expiring first means a value is never republished on the tick it dies.
    pub fn sweep(&self, republish_interval: Duration) -> Vec<DueRepublish> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);

        let expired = before - entries.len();
        if expired > 0 {
            debug!(expired, "Expired values");
        }

        entries
            .iter_mut()
            .filter(|(_, entry)| entry.republish_at <= now)
            .map(|(key, entry)| {
                entry.republish_at = deadline(now, republish_interval);

                DueRepublish {
                    key: *key,
                    value: entry.value.clone(),
                    remaining_ttl: entry.expires_at.saturating_duration_since(now),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn write_then_read() {
        let store = Store::new();
        let key = Id::random();

        store.write(key, Bytes::from_static(b"value"), Duration::from_secs(60), HOUR);

        assert_eq!(store.read(&key), Some(Bytes::from_static(b"value")));
        assert_eq!(store.read(&Id::random()), None);
    }

    #[test]
    fn last_writer_wins() {
        let store = Store::new();
        let key = Id::random();

        store.write(key, Bytes::from_static(b"first"), HOUR, HOUR);
        store.write(key, Bytes::from_static(b"second"), HOUR, HOUR);

        assert_eq!(store.read(&key), Some(Bytes::from_static(b"second")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn zero_ttl_expires_on_next_sweep() {
        let store = Store::new();
        let key = Id::random();
        let kept = Id::random();

        store.write(key, Bytes::from_static(b"gone"), Duration::ZERO, HOUR);
        store.write(kept, Bytes::from_static(b"kept"), HOUR, HOUR);

        // Expiry is lazy: still readable until swept.
        assert!(store.read(&key).is_some());

        store.sweep(HOUR);

        assert_eq!(store.read(&key), None);
        assert!(store.read(&kept).is_some());
    }

    #[test]
    fn sweep_reports_due_republish_once() {
        let store = Store::new();
        let key = Id::random();

        store.write(key, Bytes::from_static(b"value"), HOUR, Duration::ZERO);

        let due = store.sweep(HOUR);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, key);
        assert_eq!(due[0].value, Bytes::from_static(b"value"));
        assert!(due[0].remaining_ttl <= HOUR);
        assert!(due[0].remaining_ttl > HOUR - Duration::from_secs(5));

        assert!(store.sweep(HOUR).is_empty());
    }

    #[test]
    fn expired_value_is_not_republished() {
        let store = Store::new();

        store.write(
            Id::random(),
            Bytes::from_static(b"value"),
            Duration::ZERO,
            Duration::ZERO,
        );

        assert!(store.sweep(HOUR).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn unrepresentable_deadlines_are_clamped() {
        let store = Store::new();
        let key = Id::random();

        store.write(key, Bytes::from_static(b"value"), Duration::MAX, Duration::MAX);

        assert!(store.sweep(Duration::MAX).is_empty());
        assert_eq!(store.read(&key), Some(Bytes::from_static(b"value")));
    }

    #[test]
    fn concurrent_writes_survive_sweeps() {
        let store = Arc::new(Store::new());
        let writers = 4;
        let per_writer = 250;

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut keys = Vec::with_capacity(per_writer);
                    for _ in 0..per_writer {
                        let key = Id::random();
                        store.write(key, Bytes::from_static(b"value"), HOUR, Duration::ZERO);
                        keys.push(key);
                    }
                    keys
                })
            })
            .collect();

        let sweeper = {
            let store = store.clone();
            thread::spawn(move || {
                let mut republished = 0;
                for _ in 0..200 {
                    republished += store.sweep(HOUR).len();
                    thread::yield_now();
                }
                republished
            })
        };

        let keys: Vec<Id> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let republished = sweeper.join().unwrap();

        assert_eq!(store.len(), writers * per_writer);
        assert!(keys.iter().all(|key| store.read(key).is_some()));

        // Every entry is republished exactly once across all sweeps.
        let remaining = store.sweep(HOUR).len();
        assert_eq!(republished + remaining, writers * per_writer);
    }
}
