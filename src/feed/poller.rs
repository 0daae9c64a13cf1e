//! The single task that refreshes the price cache.

use super::PriceCache;
use crate::venue::{with_retry, RetryPolicy, VenueGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PricePoller {
    venue: Arc<dyn VenueGateway>,
    cache: PriceCache,
    interval: Duration,
    retry: RetryPolicy,
}

impl PricePoller {
    pub fn new(
        venue: Arc<dyn VenueGateway>,
        cache: PriceCache,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            venue,
            cache,
            interval,
            retry,
        }
    }

    /// Refresh every watched product once. Returns how many were updated.
    ///
    /// A failed product keeps its previous snapshot, which ages into
    /// staleness on its own.
    pub async fn poll_once(&self) -> usize {
        let mut updated = 0;
        for product_id in self.cache.watched() {
            let result = with_retry(&self.retry, "get_price", || {
                self.venue.get_price(product_id)
            })
            .await;
            match result {
                Ok(snapshot) => {
                    self.cache.insert(snapshot);
                    updated += 1;
                }
                Err(e) => warn!(product = %product_id, error = %e, "Price refresh failed"),
            }
        }
        debug!(updated, "Price poll complete");
        updated
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Price poller started");
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Price poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decimal, ProductId};
    use crate::venue::{MockVenue, MockOp, VenueError};

    #[tokio::test]
    async fn test_poll_once_fills_cache_for_watched_products() {
        let venue = MockVenue::new().with_price(ProductId::new(2), Decimal::from_i64(100));
        let cache = PriceCache::new(10_000);
        cache.watch(ProductId::new(2));
        let poller = PricePoller::new(
            Arc::new(venue),
            cache.clone(),
            Duration::from_millis(10),
            RetryPolicy::default(),
        );

        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(
            cache.fresh(ProductId::new(2)).unwrap().mark,
            Decimal::from_i64(100)
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let venue = MockVenue::new().with_price(ProductId::new(2), Decimal::from_i64(100));
        let cache = PriceCache::new(10_000);
        cache.watch(ProductId::new(2));
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let poller = PricePoller::new(
            Arc::new(venue.clone()),
            cache.clone(),
            Duration::from_millis(10),
            policy,
        );
        poller.poll_once().await;

        venue.fail_next(MockOp::Price, VenueError::RateLimited, 1);
        assert_eq!(poller.poll_once().await, 0);
        assert!(cache.latest(ProductId::new(2)).is_some());
    }
}
