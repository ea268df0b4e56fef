use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::store::{StoreError, WalStore};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that periodically compacts the WAL once enough appends
/// have accumulated since the last compaction.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            // Retried on the next tick.
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    info!("compacting WAL after {appends} appends");
    store.compact().await?;
    Ok(true)
}
