//! Shared price cache and the single task that refreshes it.

pub mod cache;
pub mod poller;

pub use cache::PriceCache;
pub use poller::PricePoller;
