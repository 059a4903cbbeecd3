//! Mint builder: settles confirmed deposits by issuing shadow tokens.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use secp256k1::SecretKey;
use tracing::{debug, info, warn};

use crate::coordinator::{
    sign_recoverable, CollectError, SignRequest, SignatureCoordinator, SignerClient,
};
use crate::db::{Store, TransferRecord};
use crate::rpc::{ChainRpc, LiveCell, Script};
use crate::tx::{self, MultisigConfig};
use crate::types::{Asset, Chain, Direction, RecordStatus};

use super::{
    record_summaries, reconcile, wait_until_committed, COMMIT_ATTEMPTS,
    TRACKING_COMMIT_ATTEMPTS,
};

#[derive(Debug, Clone)]
pub struct MintBuilderConfig {
    /// Type script code hash of the shadow token.
    pub token_code_hash: String,
    /// Lock code hash of the bridge tracking cells.
    pub tracking_code_hash: String,
    /// Lock code hash recipient identities resolve to.
    pub recipient_code_hash: String,
    /// Hot-key lock funding tracking-cell creation.
    pub funding_lock: Script,
    /// Most deposits settled per mint transaction.
    pub batch_limit: i64,
    /// Shadow tip at startup; minting waits until the watcher has passed it
    /// so settled mints are recognized before new ones are built.
    pub sync_barrier_height: u64,
}

pub struct MintBuilder {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    coordinator: SignatureCoordinator<Arc<dyn SignerClient>>,
    multisig: MultisigConfig,
    hot_key: SecretKey,
    assets: HashMap<String, Asset>,
    config: MintBuilderConfig,
}

impl MintBuilder {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        coordinator: SignatureCoordinator<Arc<dyn SignerClient>>,
        multisig: MultisigConfig,
        hot_key: SecretKey,
        assets: &[Asset],
        config: MintBuilderConfig,
    ) -> Self {
        let assets = assets
            .iter()
            .map(|asset| (asset.id().to_string(), asset.clone()))
            .collect();
        Self {
            rpc,
            store,
            coordinator,
            multisig,
            hot_key,
            assets,
            config,
        }
    }

    /// One builder pass: reconcile, select, and drive per-asset batches.
    pub async fn process_pending(&self) -> Result<()> {
        if !self.watcher_synced().await? {
            debug!("shadow watcher behind startup tip, holding mints");
            return Ok(());
        }

        reconcile(self.store.as_ref(), self.rpc.as_ref(), Direction::Inbound).await?;

        let todo = self
            .store
            .records_by_status(Direction::Inbound, RecordStatus::Todo, self.config.batch_limit)
            .await?;
        if todo.is_empty() {
            return Ok(());
        }

        // deterministic per-asset grouping
        let mut by_asset: BTreeMap<String, Vec<TransferRecord>> = BTreeMap::new();
        for record in todo {
            by_asset.entry(record.asset.clone()).or_default().push(record);
        }

        for (asset_id, records) in by_asset {
            let Some(asset) = self.assets.get(&asset_id) else {
                warn!(asset = %asset_id, "confirmed records for unlisted asset, skipping");
                continue;
            };
            self.drive_batch(asset, records).await?;
        }
        Ok(())
    }

    async fn watcher_synced(&self) -> Result<bool> {
        let checkpoint = self.store.checkpoint(Chain::Shadow).await?;
        Ok(checkpoint
            .map(|c| c.block_height as u64 >= self.config.sync_barrier_height)
            .unwrap_or(false))
    }

    async fn drive_batch(&self, asset: &Asset, records: Vec<TransferRecord>) -> Result<()> {
        let tracking_cell = self.ensure_tracking_cell(asset).await?;

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.store.mark_pending(&ids).await?;

        let unsigned = match tx::build_mint_tx(
            asset,
            &tracking_cell,
            &self.config.token_code_hash,
            &self.config.recipient_code_hash,
            &records,
        ) {
            Ok(unsigned) => unsigned,
            Err(e) => {
                // recoverable: put the batch back and try again next pass
                warn!(asset = %asset.id(), error = %e, "mint assembly failed, requeueing batch");
                for id in &ids {
                    self.store.requeue(id, &format!("mint assembly failed: {e}")).await?;
                }
                return Ok(());
            }
        };

        let multisig_digest = unsigned.multisig_digest()?;
        let request = SignRequest {
            raw_tx: format!("0x{}", hex::encode(unsigned.unsigned_bytes()?)),
            digest: format!("0x{}", hex::encode(multisig_digest)),
            direction: Direction::Inbound,
            records: record_summaries(&records),
        };

        let signatures = match self.coordinator.collect(&multisig_digest, &request).await {
            Ok(signatures) => signatures,
            Err(e @ CollectError::Shortfall { .. }) => {
                warn!(asset = %asset.id(), error = %e, "mint batch failed signature collection");
                for id in &ids {
                    self.store
                        .finalize(id, RecordStatus::Error, Some(&e.to_string()))
                        .await?;
                }
                return Ok(());
            }
        };

        let local_signature = sign_recoverable(&self.hot_key, &unsigned.hotkey_digest()?);
        let sealed = unsigned.seal(&local_signature, Some(self.multisig.witness(&signatures)?))?;

        for id in &ids {
            if !self.store.set_target_tx(id, &sealed.hash).await? {
                warn!(record_id = %id, "record already has a target tx, leaving for reconciliation");
                return Ok(());
            }
        }

        let tx_hash = match self.rpc.send_transaction(&sealed).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                warn!(error = %e, "mint broadcast failed");
                for id in &ids {
                    self.store
                        .finalize(
                            id,
                            RecordStatus::Error,
                            Some(&format!("mint broadcast failed: {e}")),
                        )
                        .await?;
                }
                return Ok(());
            }
        };
        info!(tx_hash = %tx_hash, batch = ids.len(), asset = %asset.id(), "mint broadcast");

        if wait_until_committed(self.rpc.as_ref(), &tx_hash, COMMIT_ATTEMPTS).await? {
            for id in &ids {
                self.store.finalize(id, RecordStatus::Success, None).await?;
            }
            info!(tx_hash = %tx_hash, "mint committed");
        } else {
            // not retried automatically: the broadcast may still land
            warn!(tx_hash = %tx_hash, "mint not committed within poll budget");
            for id in &ids {
                self.store
                    .finalize(
                        id,
                        RecordStatus::Error,
                        Some(&format!("mint {tx_hash} not committed within poll budget")),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Find the asset's tracking cell, creating it for a first-seen asset.
    async fn ensure_tracking_cell(&self, asset: &Asset) -> Result<LiveCell> {
        let tracking_lock = Script::new(
            self.config.tracking_code_hash.clone(),
            asset.tracking_script_args(),
        );
        if let Some(cell) = self.rpc.live_cells_by_lock(&tracking_lock, 1).await?.pop() {
            return Ok(cell);
        }

        info!(asset = %asset.id(), "no tracking cell yet, creating one");
        let funding = self
            .rpc
            .live_cells_by_lock(&self.config.funding_lock, 1)
            .await?
            .pop()
            .ok_or_else(|| eyre!("no funding cell available for tracking creation"))?;

        let unsigned = tx::build_tracking_tx(asset, &funding, &self.config.tracking_code_hash)?;
        let local_signature = sign_recoverable(&self.hot_key, &unsigned.hotkey_digest()?);
        let sealed = unsigned.seal(&local_signature, None)?;

        let tx_hash = self
            .rpc
            .send_transaction(&sealed)
            .await
            .wrap_err("Failed to broadcast tracking creation")?;
        if !wait_until_committed(self.rpc.as_ref(), &tx_hash, TRACKING_COMMIT_ATTEMPTS).await? {
            return Err(eyre!("tracking creation {tx_hash} not committed in time"));
        }

        self.rpc
            .live_cells_by_lock(&tracking_lock, 1)
            .await?
            .pop()
            .ok_or_else(|| eyre!("tracking cell missing after creation"))
    }
}
