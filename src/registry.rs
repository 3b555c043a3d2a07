//! Authoritative `domain -> current signing KID` mapping.
//!
//! Two cache layers over the policy store: a process-local LRU and the
//! shared TTL map. The policy store is the source of truth; the registry
//! only reflects what the store has already acknowledged, and `set`
//! refuses to cache a kid the store disagrees with.

use crate::cache::{LruCache, TtlCache};
use crate::clock::Clock;
use crate::error::VaultError;
use crate::policy::PolicyStore;
use chrono::Duration;
use std::sync::{Arc, Mutex};

pub struct ActiveKidRegistry {
    local: Mutex<LruCache<String, String>>,
    shared: TtlCache<String>,
    policies: Arc<dyn PolicyStore>,
    cache_ttl: Duration,
}

impl ActiveKidRegistry {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        clock: Arc<dyn Clock>,
        local_capacity: usize,
        shared_capacity: usize,
        cache_ttl_secs: i64,
    ) -> Self {
        Self {
            local: Mutex::new(LruCache::new(local_capacity)),
            shared: TtlCache::new(shared_capacity, clock),
            policies,
            cache_ttl: Duration::seconds(cache_ttl_secs),
        }
    }

    /// Local map, then shared cache, then the policy store. A store hit
    /// populates both layers. `None` when no policy exists.
    pub fn get(&self, domain: &str) -> Result<Option<String>, VaultError> {
        if let Some(kid) = self.local.lock().unwrap().get(&domain.to_string()) {
            return Ok(Some(kid));
        }
        if let Some(kid) = self.shared.get(domain) {
            self.local.lock().unwrap().insert(domain.to_string(), kid.clone());
            return Ok(Some(kid));
        }
        match self.policies.find_by_domain(domain)? {
            Some(policy) => {
                let kid = policy.active_kid.to_string();
                self.shared.put(domain, kid.clone(), self.cache_ttl);
                self.local.lock().unwrap().insert(domain.to_string(), kid.clone());
                Ok(Some(kid))
            }
            None => Ok(None),
        }
    }

    /// Consistency guard: the write is refused unless the policy store
    /// already names `kid` as active for `domain`. Nothing is mutated on
    /// refusal.
    pub fn set(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        let acknowledged = self
            .policies
            .find_by_domain(domain)?
            .map(|p| p.active_kid.to_string());
        if acknowledged.as_deref() != Some(kid) {
            return Err(VaultError::validation(
                "kid",
                format!(
                    "refusing to cache {} for {}: policy store says {:?}",
                    kid, domain, acknowledged
                ),
            ));
        }
        self.shared.put(domain, kid.to_string(), self.cache_ttl);
        self.local.lock().unwrap().insert(domain.to_string(), kid.to_string());
        Ok(())
    }

    /// Clear both layers.
    pub fn delete(&self, domain: &str) {
        self.local.lock().unwrap().remove(&domain.to_string());
        self.shared.remove(domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::MemoryPolicyStore;
    use crate::types::{Kid, RotationPolicy};
    use chrono::Utc;

    fn setup() -> (Arc<MemoryPolicyStore>, ActiveKidRegistry) {
        let store = Arc::new(MemoryPolicyStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let registry = ActiveKidRegistry::new(store.clone(), clock, 16, 16, 300);
        (store, registry)
    }

    fn policy(domain: &str, kid: &str) -> RotationPolicy {
        let now = Utc::now();
        RotationPolicy {
            domain: domain.to_string(),
            active_kid: Kid::new(kid),
            rotation_interval_days: 30,
            rotated_at: now,
            next_rotation_at: now,
            enabled: true,
            note: None,
        }
    }

    #[test]
    fn read_through_populates_and_returns() {
        let (store, registry) = setup();
        assert_eq!(registry.get("USER").unwrap(), None);
        store.create_policy(policy("USER", "USER-1")).unwrap();
        assert_eq!(registry.get("USER").unwrap(), Some("USER-1".into()));
    }

    #[test]
    fn set_refuses_disagreeing_kid() {
        let (store, registry) = setup();
        store.create_policy(policy("USER", "USER-1")).unwrap();
        let err = registry.set("USER", "USER-2").unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
        // The refused write left no trace in either layer.
        assert_eq!(registry.get("USER").unwrap(), Some("USER-1".into()));
    }

    #[test]
    fn delete_forces_reload_from_store() {
        let (store, registry) = setup();
        store.create_policy(policy("USER", "USER-1")).unwrap();
        assert_eq!(registry.get("USER").unwrap(), Some("USER-1".into()));

        // Mutate the store behind the caches, then invalidate.
        let mut updated = policy("USER", "USER-2");
        updated.domain = "USER".into();
        store.update_policy(updated).unwrap();
        registry.delete("USER");
        assert_eq!(registry.get("USER").unwrap(), Some("USER-2".into()));
    }
}
