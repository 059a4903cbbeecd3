//! Transaction building and submission.
//!
//! One builder per direction: `mint` settles confirmed deposits on the
//! shadow chain, `unlock` settles confirmed burns on the source chain. Both
//! run under the `BuilderManager` poll loop together with the confirmation
//! tracker, and both reconcile against chain state before building so a
//! transaction broadcast before a crash is never submitted twice.

use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::confirmation::ConfirmationTracker;
use crate::coordinator::{RecordSummary, RetryConfig};
use crate::db::{Store, TransferRecord};
use crate::rpc::{ChainRpc, TxStatus};
use crate::types::{Direction, RecordStatus};

pub mod mint;
pub mod unlock;

pub use mint::MintBuilder;
pub use unlock::UnlockBuilder;

/// Commitment poll cadence after broadcast.
pub const COMMIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Poll attempts for a mint or unlock transaction.
pub const COMMIT_ATTEMPTS: u32 = 200;
/// Poll attempts for the tracking-cell pre-step.
pub const TRACKING_COMMIT_ATTEMPTS: u32 = 120;

/// Consecutive failures before pausing a builder.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

/// Poll a broadcast transaction until committed. Returns false when the
/// attempt budget runs out.
pub(crate) async fn wait_until_committed(
    rpc: &dyn ChainRpc,
    tx_hash: &str,
    attempts: u32,
) -> Result<bool> {
    for _ in 0..attempts {
        match rpc.transaction_status(tx_hash).await? {
            TxStatus::Committed { .. } => return Ok(true),
            TxStatus::Pending | TxStatus::NotFound => {
                tokio::time::sleep(COMMIT_POLL_INTERVAL).await;
            }
        }
    }
    Ok(false)
}

/// Square pending records with chain state before building.
///
/// A pending record whose target transaction is committed is settled. One
/// whose target never landed is failed: the broadcast may have had partial
/// side effects, so it is never rebuilt automatically; an operator has to
/// inspect and re-drive it. Only records with no target at all (crash
/// before broadcast) go back to `Todo` for a rebuild.
pub(crate) async fn reconcile(
    store: &dyn Store,
    rpc: &dyn ChainRpc,
    direction: Direction,
) -> Result<()> {
    let pending = store
        .records_by_status(direction, RecordStatus::Pending, 1000)
        .await?;
    for record in pending {
        match &record.target_tx_hash {
            Some(target) => match rpc.transaction_status(target).await? {
                TxStatus::Committed { .. } => {
                    info!(record_id = %record.id, target_tx = %target, "pending transfer already committed, settling");
                    store
                        .finalize(&record.id, RecordStatus::Success, None)
                        .await?;
                }
                TxStatus::Pending => {}
                TxStatus::NotFound => {
                    warn!(record_id = %record.id, target_tx = %target, "target tx never landed, failing for operator review");
                    store
                        .finalize(
                            &record.id,
                            RecordStatus::Error,
                            Some(&format!("target tx {target} not found on chain")),
                        )
                        .await?;
                }
            },
            None => {
                store
                    .requeue(&record.id, "interrupted before broadcast")
                    .await?;
            }
        }
    }
    Ok(())
}

pub(crate) fn record_summaries(records: &[TransferRecord]) -> Vec<RecordSummary> {
    records
        .iter()
        .map(|record| RecordSummary {
            id: record.id.clone(),
            asset: record.asset.clone(),
            amount: record.amount.clone(),
            recipient: record.recipient.clone(),
        })
        .collect()
}

/// Drives the confirmation tracker and both builders.
pub struct BuilderManager {
    confirmation: ConfirmationTracker,
    mint_builder: MintBuilder,
    unlock_builder: UnlockBuilder,
    retry_config: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    consecutive_confirmation_failures: u32,
    consecutive_mint_failures: u32,
    consecutive_unlock_failures: u32,
}

impl BuilderManager {
    pub fn new(
        confirmation: ConfirmationTracker,
        mint_builder: MintBuilder,
        unlock_builder: UnlockBuilder,
    ) -> Self {
        Self {
            confirmation,
            mint_builder,
            unlock_builder,
            retry_config: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            consecutive_confirmation_failures: 0,
            consecutive_mint_failures: 0,
            consecutive_unlock_failures: 0,
        }
    }

    /// Run the poll loop until shutdown
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let poll_interval = Duration::from_millis(5000);
        let mut cycle_count = 0u64;

        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Builder manager starting poll loop"
        );

        loop {
            cycle_count += 1;

            // Log every 12 cycles (~60 seconds) to show the builders are alive
            if cycle_count % 12 == 1 {
                info!(
                    cycle = cycle_count,
                    confirmation_failures = self.consecutive_confirmation_failures,
                    mint_failures = self.consecutive_mint_failures,
                    unlock_failures = self.consecutive_unlock_failures,
                    "Builder manager heartbeat"
                );
            }

            tokio::select! {
                _ = self.process_pending() => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping builders");
                    return Ok(());
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn process_pending(&mut self) -> Result<()> {
        if let Some(pause) = self.check_breaker("confirmation", self.consecutive_confirmation_failures) {
            tokio::time::sleep(pause).await;
            self.consecutive_confirmation_failures = 0;
        }
        match self.confirmation.pass().await {
            Ok(()) => self.consecutive_confirmation_failures = 0,
            Err(e) => {
                self.consecutive_confirmation_failures += 1;
                self.backoff("confirmation", &e, self.consecutive_confirmation_failures)
                    .await;
            }
        }

        if let Some(pause) = self.check_breaker("mint", self.consecutive_mint_failures) {
            tokio::time::sleep(pause).await;
            self.consecutive_mint_failures = 0;
        }
        match self.mint_builder.process_pending().await {
            Ok(()) => self.consecutive_mint_failures = 0,
            Err(e) => {
                self.consecutive_mint_failures += 1;
                self.backoff("mint", &e, self.consecutive_mint_failures).await;
            }
        }

        if let Some(pause) = self.check_breaker("unlock", self.consecutive_unlock_failures) {
            tokio::time::sleep(pause).await;
            self.consecutive_unlock_failures = 0;
        }
        match self.unlock_builder.process_pending().await {
            Ok(()) => self.consecutive_unlock_failures = 0,
            Err(e) => {
                self.consecutive_unlock_failures += 1;
                self.backoff("unlock", &e, self.consecutive_unlock_failures)
                    .await;
            }
        }

        Ok(())
    }

    fn check_breaker(&self, component: &str, failures: u32) -> Option<Duration> {
        if failures >= self.circuit_breaker.threshold {
            warn!(
                component,
                failures,
                pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                "Circuit breaker tripped, pausing"
            );
            Some(self.circuit_breaker.pause_duration)
        } else {
            None
        }
    }

    async fn backoff(&self, component: &str, error: &eyre::Report, failures: u32) {
        let backoff = self.retry_config.backoff_for_attempt(failures);
        tracing::error!(
            component,
            error = %error,
            consecutive_failures = failures,
            next_backoff_secs = backoff.as_secs(),
            "Builder pass failed, will retry with backoff"
        );
        tokio::time::sleep(backoff).await;
    }
}
