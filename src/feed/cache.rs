//! Read-shared latest-price map.

use crate::domain::{PriceSnapshot, ProductId, TimeMs};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct CacheInner {
    snapshots: HashMap<ProductId, PriceSnapshot>,
    watched: BTreeSet<ProductId>,
}

/// Latest snapshot per product. Clones share the same map.
///
/// Only the poller writes; every task may read. Readers ask for a
/// [`fresh`](PriceCache::fresh) snapshot and skip their tick when none is
/// available.
#[derive(Debug, Clone)]
pub struct PriceCache {
    inner: Arc<RwLock<CacheInner>>,
    max_age_ms: i64,
}

impl PriceCache {
    pub fn new(max_age_ms: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            max_age_ms,
        }
    }

    pub fn max_age_ms(&self) -> i64 {
        self.max_age_ms
    }

    /// Ask the poller to keep this product refreshed.
    pub fn watch(&self, product_id: ProductId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .insert(product_id);
    }

    pub fn watched(&self) -> Vec<ProductId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .iter()
            .copied()
            .collect()
    }

    /// Store a snapshot unless a newer one is already cached.
    pub fn insert(&self, snapshot: PriceSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let newer_cached = inner
            .snapshots
            .get(&snapshot.product_id)
            .is_some_and(|current| current.observed_at > snapshot.observed_at);
        if !newer_cached {
            inner.snapshots.insert(snapshot.product_id, snapshot);
        }
    }

    /// Latest snapshot regardless of age.
    pub fn latest(&self, product_id: ProductId) -> Option<PriceSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(&product_id)
            .copied()
    }

    /// Latest snapshot if it is no older than the configured max age.
    pub fn fresh(&self, product_id: ProductId) -> Option<PriceSnapshot> {
        self.fresh_at(product_id, TimeMs::now())
    }

    pub fn fresh_at(&self, product_id: ProductId, now: TimeMs) -> Option<PriceSnapshot> {
        self.latest(product_id)
            .filter(|snapshot| !snapshot.is_stale(self.max_age_ms, now))
    }
}
