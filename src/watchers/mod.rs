use eyre::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod shadow;
pub mod source;

pub use shadow::ShadowWatcher;
pub use source::SourceWatcher;

/// Most blocks a single poll pass may process.
pub const MAX_BATCH_BLOCKS: u64 = 5000;
/// Sleep when the watcher has caught up with the tip.
pub const IDLE_SLEEP: Duration = Duration::from_secs(8);
/// Backoff after a failed poll pass.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(3);

/// The block range a poll pass should cover, or `None` when caught up.
pub(crate) fn batch_range(last_processed: u64, tip: u64) -> Option<(u64, u64)> {
    if tip <= last_processed {
        return None;
    }
    let from = last_processed + 1;
    let to = tip.min(last_processed + MAX_BATCH_BLOCKS);
    Some((from, to))
}

/// Manages the per-chain watchers
pub struct WatcherManager {
    shadow_watcher: ShadowWatcher,
    source_watcher: SourceWatcher,
}

impl WatcherManager {
    pub fn new(shadow_watcher: ShadowWatcher, source_watcher: SourceWatcher) -> Self {
        info!("Watcher manager created");
        Self {
            shadow_watcher,
            source_watcher,
        }
    }

    /// Run all watchers concurrently
    /// Returns when any watcher fails or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        let shadow = self.shadow_watcher;
        join_set.spawn(async move { shadow.run().await });
        let source = self.source_watcher;
        join_set.spawn(async move { source.run().await });

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A watcher exited unexpectedly without error");
                        Err(eyre::eyre!("watcher exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        error!("All watcher tasks exited unexpectedly");
                        Err(eyre::eyre!("all watcher tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}
