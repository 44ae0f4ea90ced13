use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::JournaledStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Compact the log once `threshold` appends have accumulated since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(store: &JournaledStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            debug!("compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL bounded.
pub async fn run_compactor(store: Arc<JournaledStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}
