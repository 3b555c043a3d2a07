//! Per-domain rotation locks, bounded in total.
//!
//! Backed by the shared TTL map: acquisition is an atomic set-if-absent
//! with a TTL, so a crashed holder's lock disappears on its own. Release is
//! fenced by the holder token, which defeats a stale holder deleting its
//! successor's lock. A global capacity cap bounds state growth in the
//! backing store; requesters beyond the cap get `None`, no queuing.

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::VaultError;
use chrono::Duration;
use rand_core::{OsRng, RngCore};
use std::sync::Arc;

pub struct LockManager {
    table: TtlCache<String>,
}

impl LockManager {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: TtlCache::new(capacity, clock),
        }
    }

    /// Try to take the lock for `domain`. Returns the holder token, or
    /// `None` when the lock is held or the global cap is reached.
    pub fn acquire(&self, domain: &str, ttl_secs: i64) -> Result<Option<String>, VaultError> {
        // Opportunistic sweep so expired holders do not count against the cap.
        self.table.prune_expired();

        if self.table.len() >= self.table.capacity() {
            tracing::warn!(domain, "lock capacity reached, refusing acquire");
            return Ok(None);
        }

        let token = fresh_token();
        if self
            .table
            .put_if_absent(domain, token.clone(), Duration::seconds(ttl_secs))
        {
            tracing::debug!(domain, "rotation lock acquired");
            Ok(Some(token))
        } else {
            tracing::debug!(domain, "rotation lock held elsewhere");
            Ok(None)
        }
    }

    /// Fenced release: deletes the entry only while it still carries
    /// `token`. Returns whether a deletion happened.
    pub fn release(&self, domain: &str, token: &str) -> Result<bool, VaultError> {
        let released = self.table.remove_if_value(domain, &token.to_string());
        if !released {
            tracing::warn!(domain, "release skipped: token mismatch or lock expired");
        }
        Ok(released)
    }

    pub fn held_count(&self) -> usize {
        self.table.prune_expired();
        self.table.len()
    }
}

fn fresh_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager(capacity: usize) -> (Arc<ManualClock>, LockManager) {
        let clock = Arc::new(ManualClock::starting_now());
        let mgr = LockManager::new(capacity, clock.clone());
        (clock, mgr)
    }

    #[test]
    fn second_acquire_returns_none() {
        let (_clock, mgr) = manager(8);
        let token = mgr.acquire("USER", 60).unwrap();
        assert!(token.is_some());
        assert!(mgr.acquire("USER", 60).unwrap().is_none());
    }

    #[test]
    fn release_requires_exact_token() {
        let (_clock, mgr) = manager(8);
        let token = mgr.acquire("USER", 60).unwrap().unwrap();
        assert!(!mgr.release("USER", "impostor").unwrap());
        assert!(mgr.release("USER", &token).unwrap());
        assert!(mgr.acquire("USER", 60).unwrap().is_some());
    }

    #[test]
    fn ttl_expiry_frees_the_lock() {
        let (clock, mgr) = manager(8);
        let stale = mgr.acquire("USER", 60).unwrap().unwrap();
        clock.advance(Duration::seconds(61));
        let fresh = mgr.acquire("USER", 60).unwrap();
        assert!(fresh.is_some());
        // The stale holder cannot release its successor's lock.
        assert!(!mgr.release("USER", &stale).unwrap());
    }

    #[test]
    fn capacity_cap_refuses_even_free_keys() {
        let (clock, mgr) = manager(1);
        assert!(mgr.acquire("A", 60).unwrap().is_some());
        assert!(mgr.acquire("B", 60).unwrap().is_none());
        clock.advance(Duration::seconds(61));
        // Pruning on acquire frees capacity once A expires.
        assert!(mgr.acquire("B", 60).unwrap().is_some());
    }
}
