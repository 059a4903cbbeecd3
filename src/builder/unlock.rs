//! Unlock builder: settles confirmed burns by paying out of escrow.

use std::sync::Arc;

use eyre::Result;
use secp256k1::SecretKey;
use tracing::{info, warn};

use crate::coordinator::{
    sign_recoverable, CollectError, SignRequest, SignatureCoordinator, SignerClient,
};
use crate::db::{Store, TransferRecord};
use crate::rpc::{ChainRpc, Script};
use crate::tx::{self, MultisigConfig, MAX_UNLOCK_BATCH};
use crate::types::{Direction, RecordStatus};

use super::{record_summaries, reconcile, wait_until_committed, COMMIT_ATTEMPTS};

/// Escrow cells fetched per pass; covers any batch the cap allows.
const ESCROW_QUERY_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct UnlockBuilderConfig {
    /// The multisig escrow lock holding deposited funds.
    pub escrow_lock: Script,
    /// Lock code hash burn recipients resolve to.
    pub recipient_code_hash: String,
}

pub struct UnlockBuilder {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    coordinator: SignatureCoordinator<Arc<dyn SignerClient>>,
    multisig: MultisigConfig,
    hot_key: SecretKey,
    config: UnlockBuilderConfig,
}

impl UnlockBuilder {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        coordinator: SignatureCoordinator<Arc<dyn SignerClient>>,
        multisig: MultisigConfig,
        hot_key: SecretKey,
        config: UnlockBuilderConfig,
    ) -> Self {
        Self {
            rpc,
            store,
            coordinator,
            multisig,
            hot_key,
            config,
        }
    }

    /// One builder pass: reconcile, then settle at most one capped batch.
    pub async fn process_pending(&self) -> Result<()> {
        reconcile(self.store.as_ref(), self.rpc.as_ref(), Direction::Outbound).await?;

        let todo = self
            .store
            .records_by_status(
                Direction::Outbound,
                RecordStatus::Todo,
                MAX_UNLOCK_BATCH as i64,
            )
            .await?;
        if todo.is_empty() {
            return Ok(());
        }

        self.drive_batch(todo).await
    }

    async fn drive_batch(&self, records: Vec<TransferRecord>) -> Result<()> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.store.mark_pending(&ids).await?;

        let escrow_cells = self
            .rpc
            .live_cells_by_lock(&self.config.escrow_lock, ESCROW_QUERY_LIMIT)
            .await?;

        let unsigned = match tx::build_unlock_tx(
            &self.config.escrow_lock,
            &escrow_cells,
            &self.config.recipient_code_hash,
            &records,
        ) {
            Ok(unsigned) => unsigned,
            Err(e) => {
                // recoverable: escrow may be refilled or cells freed up
                warn!(error = %e, "unlock assembly failed, requeueing batch");
                for id in &ids {
                    self.store
                        .requeue(id, &format!("unlock assembly failed: {e}"))
                        .await?;
                }
                return Ok(());
            }
        };

        let multisig_digest = unsigned.multisig_digest()?;
        let request = SignRequest {
            raw_tx: format!("0x{}", hex::encode(unsigned.unsigned_bytes()?)),
            digest: format!("0x{}", hex::encode(multisig_digest)),
            direction: Direction::Outbound,
            records: record_summaries(&records),
        };

        let signatures = match self.coordinator.collect(&multisig_digest, &request).await {
            Ok(signatures) => signatures,
            Err(e @ CollectError::Shortfall { .. }) => {
                warn!(error = %e, "unlock batch failed signature collection");
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
                warn!(error = %e, "unlock broadcast failed");
                for id in &ids {
                    self.store
                        .finalize(
                            id,
                            RecordStatus::Error,
                            Some(&format!("unlock broadcast failed: {e}")),
                        )
                        .await?;
                }
                return Ok(());
            }
        };
        info!(tx_hash = %tx_hash, batch = ids.len(), "unlock broadcast");

        if wait_until_committed(self.rpc.as_ref(), &tx_hash, COMMIT_ATTEMPTS).await? {
            for id in &ids {
                self.store.finalize(id, RecordStatus::Success, None).await?;
            }
            info!(tx_hash = %tx_hash, "unlock committed");
        } else {
            // not retried automatically: the broadcast may still land
            warn!(tx_hash = %tx_hash, "unlock not committed within poll budget");
            for id in &ids {
                self.store
                    .finalize(
                        id,
                        RecordStatus::Error,
                        Some(&format!("unlock {tx_hash} not committed within poll budget")),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
