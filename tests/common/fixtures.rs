//! In-memory fixtures for engine-level tests.

use mongo_bisync::config::SyncConfig;
use mongo_bisync::coordinator::BidirectionalSync;
use mongo_bisync::store::{MemoryStore, Side};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A coordinator over two fresh in-memory stores.
pub struct MemoryPair {
    pub local: Arc<MemoryStore>,
    pub remote: Arc<MemoryStore>,
    pub sync: BidirectionalSync<MemoryStore>,
}

impl MemoryPair {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::for_testing())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let local = Arc::new(MemoryStore::new(Side::Local));
        let remote = Arc::new(MemoryStore::new(Side::Remote));
        let sync = BidirectionalSync::new(config, Arc::clone(&local), Arc::clone(&remote));
        Self {
            local,
            remote,
            sync,
        }
    }

    /// Total trait-level writes on both sides.
    pub fn writes(&self) -> u64 {
        self.local.write_count() + self.remote.write_count()
    }

    /// Wait until `writes()` stops changing for `quiet`.
    pub async fn settle(&self, quiet: Duration) -> u64 {
        let mut last = self.writes();
        let mut stable_since = Instant::now();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let now = self.writes();
            if now != last {
                last = now;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= quiet {
                break;
            }
        }
        last
    }
}

/// Poll `condition` for up to `within`.
pub async fn eventually<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(within: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition().await
}
