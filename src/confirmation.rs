//! Confirmation tracking and promotion.
//!
//! Unconfirmed records are re-measured against the chain tip every pass.
//! Once a record reaches the required depth it is promoted in one write:
//! confirmed, fee priced, and either opened for building (`Todo`) or held
//! for an operator (`ManualReview`) when its valuation clears the audit
//! ceiling.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, info, warn};

use crate::db::{Store, TransferRecord};
use crate::price::PriceSource;
use crate::rpc::{ChainRpc, TxStatus};
use crate::types::{Asset, Direction, RecordStatus};

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    /// Depth a source-chain deposit needs before minting.
    pub source_required_confirmations: i32,
    /// Depth a shadow-chain burn needs before unlocking.
    pub shadow_required_confirmations: i32,
    /// USD valuation above which a transfer is held for review. The
    /// comparison is strict: a transfer valued exactly at the ceiling still
    /// processes automatically.
    pub audit_threshold_usd: f64,
}

pub struct ConfirmationTracker {
    source_rpc: Arc<dyn ChainRpc>,
    shadow_rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    price: Arc<dyn PriceSource>,
    assets: HashMap<String, Asset>,
    config: ConfirmationConfig,
}

impl ConfirmationTracker {
    pub fn new(
        source_rpc: Arc<dyn ChainRpc>,
        shadow_rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        price: Arc<dyn PriceSource>,
        assets: &[Asset],
        config: ConfirmationConfig,
    ) -> Self {
        let assets = assets
            .iter()
            .map(|asset| (asset.id().to_string(), asset.clone()))
            .collect();
        Self {
            source_rpc,
            shadow_rpc,
            store,
            price,
            assets,
            config,
        }
    }

    /// One pass over both directions.
    pub async fn pass(&self) -> Result<()> {
        self.direction_pass(Direction::Inbound).await?;
        self.direction_pass(Direction::Outbound).await?;
        Ok(())
    }

    async fn direction_pass(&self, direction: Direction) -> Result<()> {
        let (rpc, required) = match direction {
            Direction::Inbound => (&self.source_rpc, self.config.source_required_confirmations),
            Direction::Outbound => (&self.shadow_rpc, self.config.shadow_required_confirmations),
        };

        let records = self.store.unconfirmed_records(direction).await?;
        if records.is_empty() {
            return Ok(());
        }
        let tip = rpc.tip_height().await?;

        for record in records {
            let status = rpc.transaction_status(&record.source_tx_hash).await?;
            let block_height = match status {
                TxStatus::Committed { block_height } => block_height,
                TxStatus::Pending => continue,
                TxStatus::NotFound => {
                    // dropped from the chain, likely a reorg; depth stays put
                    warn!(record_id = %record.id, "detection tx no longer on chain");
                    continue;
                }
            };

            let depth = confirmation_depth(tip, block_height);
            // depth never goes backwards on a record
            let confirm_count = depth.max(record.confirm_count);

            if confirm_count < required {
                if confirm_count != record.confirm_count {
                    self.store
                        .update_confirm_count(&record.id, confirm_count)
                        .await?;
                }
                continue;
            }

            self.promote(&record, confirm_count, direction).await?;
        }
        Ok(())
    }
}

/// Blocks mined at or after the detection block, clamped to the record
/// counter's range.
fn confirmation_depth(tip: u64, block_height: u64) -> i32 {
    (tip.saturating_sub(block_height) as i64)
        .saturating_add(1)
        .min(i32::MAX as i64) as i32
}

impl ConfirmationTracker {
    /// Price the fee, apply the audit ceiling, and open the counter-action.
    async fn promote(
        &self,
        record: &TransferRecord,
        confirm_count: i32,
        direction: Direction,
    ) -> Result<()> {
        let Some(asset) = self.assets.get(&record.asset) else {
            self.store
                .promote_confirmed(
                    &record.id,
                    confirm_count,
                    "0",
                    RecordStatus::Error,
                    Some(&format!("asset {} is not allow-listed", record.asset)),
                )
                .await?;
            return Ok(());
        };

        let fee = asset.bridge_fee(direction);
        let amount = record.amount_u128()?;
        if amount <= fee {
            let message = format!("amount {amount} does not cover bridge fee {fee}");
            warn!(record_id = %record.id, %message, "rejecting transfer");
            self.store
                .promote_confirmed(
                    &record.id,
                    confirm_count,
                    &fee.to_string(),
                    RecordStatus::Error,
                    Some(&message),
                )
                .await?;
            return Ok(());
        }

        // Price failure is transient; the record stays unconfirmed and the
        // next pass retries.
        let price = match self.price.price_usd(&asset.entry.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "price lookup failed, retrying next pass");
                return Ok(());
            }
        };

        // the audit ceiling applies to the gross deposited amount
        let value_usd = (amount as f64 / 10f64.powi(asset.entry.decimals as i32)) * price;
        let (status, message) = if value_usd > self.config.audit_threshold_usd {
            (
                RecordStatus::ManualReview,
                Some(format!(
                    "value {value_usd} USD exceeds audit threshold {}",
                    self.config.audit_threshold_usd
                )),
            )
        } else {
            (RecordStatus::Todo, None)
        };

        self.store
            .promote_confirmed(
                &record.id,
                confirm_count,
                &fee.to_string(),
                status,
                message.as_deref(),
            )
            .await?;

        match status {
            RecordStatus::ManualReview => {
                info!(record_id = %record.id, value_usd, "transfer held for manual review");
            }
            _ => {
                debug!(record_id = %record.id, confirm_count, fee, "transfer confirmed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTransferRecord, RecordStore};
    use crate::price::PriceSource;
    use crate::test_util::{FixedPrice, InMemoryStore, MockChain};
    use crate::types::{AssetEntry, ConfirmStatus};
    use async_trait::async_trait;

    fn asset(decimals: u32, in_fee: u128) -> Asset {
        Asset::new(
            AssetEntry {
                id: "escrow-native".to_string(),
                symbol: "ESC".to_string(),
                decimals,
                in_fee,
                out_fee: in_fee,
            },
            [1u8; 32],
        )
    }

    fn tracker(
        chain: Arc<MockChain>,
        store: Arc<InMemoryStore>,
        price: Arc<dyn PriceSource>,
        asset: Asset,
        threshold: f64,
    ) -> ConfirmationTracker {
        ConfirmationTracker::new(
            chain.clone(),
            chain,
            store,
            price,
            &[asset],
            ConfirmationConfig {
                source_required_confirmations: 3,
                shadow_required_confirmations: 3,
                audit_threshold_usd: threshold,
            },
        )
    }

    async fn seed_deposit(store: &InMemoryStore, id: &str, amount: u128) {
        store
            .insert_record(&NewTransferRecord {
                id: id.to_string(),
                direction: Direction::Inbound,
                asset: "escrow-native".to_string(),
                amount: amount.to_string(),
                sender: "src1sender".to_string(),
                recipient: "shadow1recipient".to_string(),
                source_tx_hash: id.to_string(),
                source_block_height: 5,
            })
            .await
            .unwrap();
    }

    fn commit_detection(chain: &MockChain, id: &str, height: u64) {
        chain.commit_tx(
            crate::rpc::ChainTransaction {
                hash: id.to_string(),
                inputs: vec![],
                outputs: vec![],
                outputs_data: vec![],
                witnesses: vec![],
            },
            height,
        );
    }

    #[tokio::test]
    async fn test_promotes_at_required_depth_with_fee() {
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xdep", 10_000).await;
        commit_detection(&chain, "0xdep", 5); // depth 10-5+1 = 6 >= 3

        tracker(
            chain,
            store.clone(),
            Arc::new(FixedPrice(1.0)),
            asset(0, 100),
            1e12,
        )
        .pass()
        .await
        .unwrap();

        let record = store.record("0xdep").unwrap();
        assert_eq!(record.confirm_status, ConfirmStatus::Confirmed);
        assert_eq!(record.status, RecordStatus::Todo);
        assert_eq!(record.bridge_fee.as_deref(), Some("100"));
        assert!(record.confirm_count >= 3);
    }

    #[tokio::test]
    async fn test_waits_below_required_depth() {
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xdep", 10_000).await;
        commit_detection(&chain, "0xdep", 10); // depth 1 < 3

        tracker(
            chain,
            store.clone(),
            Arc::new(FixedPrice(1.0)),
            asset(0, 100),
            1e12,
        )
        .pass()
        .await
        .unwrap();

        let record = store.record("0xdep").unwrap();
        assert_eq!(record.confirm_status, ConfirmStatus::Unconfirmed);
        assert_eq!(record.confirm_count, 1);
        assert!(record.bridge_fee.is_none());
    }

    #[tokio::test]
    async fn test_amount_not_covering_fee_is_rejected() {
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xsmall", 100).await; // equals the fee
        commit_detection(&chain, "0xsmall", 5);

        tracker(
            chain,
            store.clone(),
            Arc::new(FixedPrice(1.0)),
            asset(0, 100),
            1e12,
        )
        .pass()
        .await
        .unwrap();

        let record = store.record("0xsmall").unwrap();
        assert_eq!(record.status, RecordStatus::Error);
        assert!(record.message.unwrap().contains("does not cover"));
    }

    #[tokio::test]
    async fn test_audit_threshold_boundary() {
        // price 1.0, decimals 0, zero fee: valuation equals the amount
        for (amount, expected) in [
            (100u128, RecordStatus::Todo),       // exactly at the ceiling
            (101u128, RecordStatus::ManualReview), // one unit above
        ] {
            let chain = Arc::new(MockChain::new(10));
            let store = Arc::new(InMemoryStore::new());
            seed_deposit(&store, "0xdep", amount).await;
            commit_detection(&chain, "0xdep", 5);

            tracker(
                chain,
                store.clone(),
                Arc::new(FixedPrice(1.0)),
                asset(0, 0),
                100.0,
            )
            .pass()
            .await
            .unwrap();

            let record = store.record("0xdep").unwrap();
            assert_eq!(record.status, expected, "amount {amount}");
            assert_eq!(record.confirm_status, ConfirmStatus::Confirmed);
        }
    }

    #[tokio::test]
    async fn test_audit_values_gross_amount_not_net() {
        // amount 150, fee 60: the fee must not shave the valuation below
        // the ceiling of 100
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xdep", 150).await;
        commit_detection(&chain, "0xdep", 5);

        tracker(
            chain,
            store.clone(),
            Arc::new(FixedPrice(1.0)),
            asset(0, 60),
            100.0,
        )
        .pass()
        .await
        .unwrap();

        let record = store.record("0xdep").unwrap();
        assert_eq!(record.status, RecordStatus::ManualReview);
    }

    #[test]
    fn test_confirmation_depth_clamps_instead_of_wrapping() {
        assert_eq!(confirmation_depth(10, 5), 6);
        // a detection "ahead" of the tip (index lag) counts as depth 1
        assert_eq!(confirmation_depth(5, 10), 1);
        assert_eq!(confirmation_depth(u64::MAX, 0), i32::MAX);
        assert_eq!(confirmation_depth(u32::MAX as u64 * 3, 1), i32::MAX);
    }

    struct FailingPrice;

    #[async_trait]
    impl PriceSource for FailingPrice {
        async fn price_usd(&self, _symbol: &str) -> Result<f64> {
            Err(eyre::eyre!("price endpoint unavailable"))
        }
    }

    #[tokio::test]
    async fn test_price_failure_is_recoverable() {
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xdep", 10_000).await;
        commit_detection(&chain, "0xdep", 5);

        let tracker = ConfirmationTracker::new(
            chain.clone(),
            chain,
            store.clone(),
            Arc::new(FailingPrice),
            &[asset(0, 100)],
            ConfirmationConfig {
                source_required_confirmations: 3,
                shadow_required_confirmations: 3,
                audit_threshold_usd: 100.0,
            },
        );
        tracker.pass().await.unwrap();

        // untouched, so the next pass retries the promotion
        let record = store.record("0xdep").unwrap();
        assert_eq!(record.confirm_status, ConfirmStatus::Unconfirmed);
        assert_eq!(record.status, RecordStatus::Todo);
        assert!(record.bridge_fee.is_none());
    }

    #[tokio::test]
    async fn test_confirm_count_is_monotone() {
        let chain = Arc::new(MockChain::new(10));
        let store = Arc::new(InMemoryStore::new());
        seed_deposit(&store, "0xdep", 10_000).await;
        commit_detection(&chain, "0xdep", 10); // depth 1
        store.update_confirm_count("0xdep", 2).await.unwrap();

        tracker(
            chain,
            store.clone(),
            Arc::new(FixedPrice(1.0)),
            asset(0, 100),
            1e12,
        )
        .pass()
        .await
        .unwrap();

        // recomputed depth 1 must not lower the stored count
        assert_eq!(store.record("0xdep").unwrap().confirm_count, 2);
    }
}
