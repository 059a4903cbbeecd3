//! Source-chain watcher: deposit detection and unlock settlement.
//!
//! Deposits into the escrow lock create inbound transfer records. The
//! bridge's own unlock transactions are recognized by the record ids
//! embedded in their escrow change output, and settle the outbound records
//! they cover; like the mint path on the shadow side, this is also how
//! broadcast-then-crash unlocks are reconciled after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::codec;
use crate::db::{NewTransferRecord, Store};
use crate::rpc::{BlockView, ChainRpc, ChainTransaction, Script};
use crate::tx::record_lock_id;
use crate::types::{decode_hex, Chain, Direction, RecordStatus};

use super::{batch_range, ERROR_BACKOFF, IDLE_SLEEP};

#[derive(Debug, Clone)]
pub struct SourceWatcherConfig {
    /// The multisig escrow lock deposits must pay into.
    pub escrow_lock: Script,
    /// Asset id deposits of the native escrowed asset are recorded under.
    pub native_asset_id: String,
    /// Required prefix of the shadow-chain recipient carried in the deposit
    /// memo.
    pub shadow_address_prefix: String,
    /// First block to scan when no checkpoint exists yet.
    pub start_block_height: Option<u64>,
}

pub struct SourceWatcher {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    config: SourceWatcherConfig,
}

impl SourceWatcher {
    pub fn new(rpc: Arc<dyn ChainRpc>, store: Arc<dyn Store>, config: SourceWatcherConfig) -> Self {
        Self { rpc, store, config }
    }

    /// Run the watcher loop
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    warn!(error = %e, "source watcher pass failed, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// One poll pass. Returns false when caught up with the tip.
    pub async fn poll_once(&self) -> Result<bool> {
        let last = super::shadow::bootstrap_checkpoint(
            self.rpc.as_ref(),
            self.store.as_ref(),
            Chain::Source,
            self.config.start_block_height,
        )
        .await?;
        let tip = self.rpc.tip_height().await?;

        let Some((from, to)) = batch_range(last, tip) else {
            return Ok(false);
        };

        debug!(from, to, tip, "processing source blocks");
        let mut last_hash = String::new();
        for height in from..=to {
            let block = self
                .rpc
                .block_by_height(height)
                .await?
                .ok_or_else(|| eyre::eyre!("source block {height} not available"))?;
            last_hash = block.hash.clone();
            self.process_block(&block).await?;
        }

        self.store
            .set_checkpoint(Chain::Source, to as i64, &last_hash)
            .await?;
        Ok(true)
    }

    async fn process_block(&self, block: &BlockView) -> Result<()> {
        for tx in &block.transactions {
            self.process_tx(tx, block.height).await?;
        }
        Ok(())
    }

    async fn process_tx(&self, tx: &ChainTransaction, height: u64) -> Result<()> {
        // Escrow outputs either settle an unlock (change output carrying
        // record ids) or receive a deposit (memo carrying the shadow
        // recipient).
        let mut deposits = Vec::new();
        for (index, (output, data)) in tx.outputs.iter().zip(&tx.outputs_data).enumerate() {
            if output.lock != self.config.escrow_lock {
                continue;
            }
            let raw = decode_hex(data)?;

            if let Some(recipient) = self.deposit_recipient(&raw) {
                deposits.push((index as u32, output.value, recipient));
                continue;
            }
            if let Ok(ids) = codec::decode_unlock_ids(&raw) {
                self.settle_unlock(tx, ids).await?;
                continue;
            }
            debug!(tx_hash = %tx.hash, index, "escrow output without usable memo, skipping");
        }

        if deposits.is_empty() {
            return Ok(());
        }

        let sender = self
            .resolve_sender(tx)
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let multiple = deposits.len() > 1;
        for (index, value, recipient) in deposits {
            if value == 0 {
                debug!(tx_hash = %tx.hash, index, "zero-value deposit, skipping");
                continue;
            }
            let id = if multiple {
                format!("{}-{index}", tx.hash)
            } else {
                tx.hash.clone()
            };
            let record = NewTransferRecord {
                id,
                direction: Direction::Inbound,
                asset: self.config.native_asset_id.clone(),
                amount: value.to_string(),
                sender: sender.clone(),
                recipient,
                source_tx_hash: tx.hash.clone(),
                source_block_height: height as i64,
            };
            if self.store.insert_record(&record).await? {
                info!(
                    record_id = %record.id,
                    amount = %record.amount,
                    recipient = %record.recipient,
                    "new deposit detected"
                );
            }
        }
        Ok(())
    }

    /// Deposit memo: utf-8 shadow recipient with the configured prefix.
    fn deposit_recipient(&self, memo: &[u8]) -> Option<String> {
        let recipient = std::str::from_utf8(memo).ok()?;
        if recipient.starts_with(&self.config.shadow_address_prefix) {
            Some(recipient.to_string())
        } else {
            None
        }
    }

    /// A committed unlock settles the outbound records whose ids ride in its
    /// change output.
    async fn settle_unlock(&self, tx: &ChainTransaction, ids: Vec<[u8; 32]>) -> Result<()> {
        let open = self
            .store
            .records_by_status(Direction::Outbound, RecordStatus::Pending, 5000)
            .await?;
        let by_lock_id: HashMap<[u8; 32], &str> = open
            .iter()
            .map(|record| (record_lock_id(&record.id), record.id.as_str()))
            .collect();

        for lock_id in ids {
            let Some(id) = by_lock_id.get(&lock_id) else {
                continue;
            };
            self.store.set_target_tx(id, &tx.hash).await?;
            self.store
                .finalize(id, RecordStatus::Success, None)
                .await?;
            info!(record_id = %id, unlock_tx = %tx.hash, "outbound transfer settled by unlock");
        }
        Ok(())
    }

    async fn resolve_sender(&self, tx: &ChainTransaction) -> Result<Option<String>> {
        let Some(input) = tx.inputs.first() else {
            return Ok(None);
        };
        let previous = self
            .rpc
            .transaction(&input.previous_output.tx_hash)
            .await
            .wrap_err("Failed to resolve deposit sender")?;
        Ok(previous.and_then(|tx| {
            tx.outputs
                .get(input.previous_output.index as usize)
                .map(|output| output.lock.args.clone())
        }))
    }
}
