//! Shadow-chain watcher: burn detection and mint settlement.
//!
//! Burns create outbound transfer records; mint transactions are the
//! bridge's own, and seeing one committed settles the inbound records it
//! covers. The second path doubles as restart reconciliation: a mint that
//! was broadcast before a crash is recognized here and never rebuilt.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::codec::{self, BridgeEvent, WitnessEnvelope};
use crate::db::{NewTransferRecord, Store};
use crate::rpc::{BlockView, ChainRpc, ChainTransaction, Script};
use crate::tx::record_lock_id;
use crate::types::{decode_hex, Asset, Chain, Direction, RecordStatus};

use super::{batch_range, ERROR_BACKOFF, IDLE_SLEEP};

#[derive(Debug, Clone)]
pub struct ShadowWatcherConfig {
    /// Type script code hash of the shadow token.
    pub token_code_hash: String,
    /// Lock code hash of the bridge tracking cells.
    pub tracking_code_hash: String,
    /// Lock burns send shadow tokens to.
    pub burn_lock: Script,
    /// Hex owner tag the tracking lock args must start with.
    pub owner_tag_prefix: String,
    /// First block to scan when no checkpoint exists yet.
    pub start_block_height: Option<u64>,
}

pub struct ShadowWatcher {
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    config: ShadowWatcherConfig,
    /// tracking-lock args -> asset id, for attributing burn amounts
    assets_by_args: HashMap<String, String>,
}

impl ShadowWatcher {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        config: ShadowWatcherConfig,
        assets: &[Asset],
    ) -> Self {
        let assets_by_args = assets
            .iter()
            .map(|asset| (asset.tracking_script_args(), asset.id().to_string()))
            .collect();
        Self {
            rpc,
            store,
            config,
            assets_by_args,
        }
    }

    /// Run the watcher loop
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    warn!(error = %e, "shadow watcher pass failed, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// One poll pass. Returns false when caught up with the tip.
    pub async fn poll_once(&self) -> Result<bool> {
        let last = bootstrap_checkpoint(
            self.rpc.as_ref(),
            self.store.as_ref(),
            Chain::Shadow,
            self.config.start_block_height,
        )
        .await?;
        let tip = self.rpc.tip_height().await?;

        let Some((from, to)) = batch_range(last, tip) else {
            return Ok(false);
        };

        debug!(from, to, tip, "processing shadow blocks");
        let mut last_hash = String::new();
        for height in from..=to {
            let block = self
                .rpc
                .block_by_height(height)
                .await?
                .ok_or_else(|| eyre::eyre!("shadow block {height} not available"))?;
            last_hash = block.hash.clone();
            self.process_block(&block).await?;
        }

        self.store
            .set_checkpoint(Chain::Shadow, to as i64, &last_hash)
            .await?;
        Ok(true)
    }

    async fn process_block(&self, block: &BlockView) -> Result<()> {
        for tx in &block.transactions {
            // only the first witness may carry a bridge event
            let Some(witness) = tx.witnesses.first() else {
                continue;
            };
            let Ok(raw) = decode_hex(witness) else {
                continue;
            };
            let Some(payload) = WitnessEnvelope::decode(&raw)
                .ok()
                .and_then(|envelope| envelope.input_type)
            else {
                continue;
            };
            match codec::decode_event(&payload) {
                Ok(BridgeEvent::Burn(burn)) => {
                    self.handle_burn(tx, block.height, burn.recipient).await?;
                }
                Ok(BridgeEvent::Mint(mint)) => {
                    self.handle_mint(tx, mint.lock_ids).await?;
                }
                Err(e) => {
                    // not a bridge transaction
                    debug!(tx_hash = %tx.hash, error = %e, "skipping undecodable witness");
                }
            }
        }
        Ok(())
    }

    /// A burn destroys shadow tokens by sending them to the burn lock; the
    /// witness names the source-chain recipient.
    async fn handle_burn(
        &self,
        tx: &ChainTransaction,
        height: u64,
        recipient: String,
    ) -> Result<()> {
        // A burn funded by the bridge's own cells would be the bridge paying
        // itself; discard.
        let Some(funding) = self.resolve_funding_lock(tx).await? else {
            return Ok(());
        };
        if funding == self.config.burn_lock
            || funding.code_hash == self.config.tracking_code_hash
        {
            debug!(tx_hash = %tx.hash, "burn funded by bridge lock, skipping");
            return Ok(());
        }

        let Some((asset, amount)) = self.burned_amount(tx)? else {
            return Ok(());
        };
        if amount == 0 {
            debug!(tx_hash = %tx.hash, "zero-amount burn, skipping");
            return Ok(());
        }

        let record = NewTransferRecord {
            id: tx.hash.clone(),
            direction: Direction::Outbound,
            asset: asset.clone(),
            amount: amount.to_string(),
            sender: funding.args,
            recipient,
            source_tx_hash: tx.hash.clone(),
            source_block_height: height as i64,
        };
        if self.store.insert_record(&record).await? {
            info!(
                tx_hash = %tx.hash,
                asset = %asset,
                amount,
                recipient = %record.recipient,
                "new burn detected"
            );
        }
        Ok(())
    }

    /// A committed mint settles the inbound records whose ids it embeds.
    async fn handle_mint(&self, tx: &ChainTransaction, lock_ids: Vec<[u8; 32]>) -> Result<()> {
        if !self.spends_tracking_cell(tx).await? {
            warn!(tx_hash = %tx.hash, "mint event without tracking input, ignoring");
            return Ok(());
        }

        let open = self
            .store
            .records_by_status(Direction::Inbound, RecordStatus::Pending, 5000)
            .await?;
        let by_lock_id: HashMap<[u8; 32], &str> = open
            .iter()
            .map(|record| (record_lock_id(&record.id), record.id.as_str()))
            .collect();

        for lock_id in lock_ids {
            let Some(id) = by_lock_id.get(&lock_id) else {
                continue;
            };
            self.store.set_target_tx(id, &tx.hash).await?;
            self.store
                .finalize(id, RecordStatus::Success, None)
                .await?;
            info!(record_id = %id, mint_tx = %tx.hash, "inbound transfer settled by mint");
        }
        Ok(())
    }

    /// Lock of the first input's previous output.
    async fn resolve_funding_lock(&self, tx: &ChainTransaction) -> Result<Option<Script>> {
        let Some(input) = tx.inputs.first() else {
            return Ok(None);
        };
        let previous = self
            .rpc
            .transaction(&input.previous_output.tx_hash)
            .await
            .wrap_err("Failed to resolve funding input")?;
        Ok(previous.and_then(|tx| {
            tx.outputs
                .get(input.previous_output.index as usize)
                .map(|output| output.lock.clone())
        }))
    }

    async fn spends_tracking_cell(&self, tx: &ChainTransaction) -> Result<bool> {
        for input in &tx.inputs {
            let Some(previous) = self.rpc.transaction(&input.previous_output.tx_hash).await?
            else {
                continue;
            };
            let Some(output) = previous.outputs.get(input.previous_output.index as usize)
            else {
                continue;
            };
            if output.lock.code_hash == self.config.tracking_code_hash
                && output.lock.args.starts_with(&self.config.owner_tag_prefix)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sum shadow-token outputs parked under the burn lock, attributed to
    /// one allow-listed asset.
    fn burned_amount(&self, tx: &ChainTransaction) -> Result<Option<(String, u128)>> {
        let mut found: Option<(String, u128)> = None;
        for (output, data) in tx.outputs.iter().zip(&tx.outputs_data) {
            if output.lock != self.config.burn_lock {
                continue;
            }
            let Some(type_script) = &output.type_script else {
                continue;
            };
            if type_script.code_hash != self.config.token_code_hash {
                continue;
            }
            let Some(asset_id) = self.assets_by_args.get(&type_script.args) else {
                debug!(tx_hash = %tx.hash, args = %type_script.args, "burn of unlisted asset, skipping");
                continue;
            };
            let amount = codec::read_amount(&decode_hex(data)?)?;
            match &mut found {
                None => found = Some((asset_id.clone(), amount)),
                Some((id, total)) if id == asset_id => match total.checked_add(amount) {
                    Some(sum) => *total = sum,
                    None => {
                        warn!(tx_hash = %tx.hash, "burn amount overflows, skipping");
                        return Ok(None);
                    }
                },
                Some(_) => {
                    warn!(tx_hash = %tx.hash, "burn mixes assets, skipping");
                    return Ok(None);
                }
            }
        }
        Ok(found)
    }
}

/// Last processed height, seeding the checkpoint on first run: from the
/// configured start height when given, otherwise the current tip.
pub(crate) async fn bootstrap_checkpoint(
    rpc: &dyn ChainRpc,
    store: &dyn Store,
    chain: Chain,
    start_block_height: Option<u64>,
) -> Result<u64> {
    if let Some(checkpoint) = store.checkpoint(chain).await? {
        return Ok(checkpoint.block_height as u64);
    }

    let seed = match start_block_height {
        Some(start) => start.saturating_sub(1),
        None => rpc.tip_height().await?,
    };
    let hash = rpc.block_hash(seed).await?;
    store.set_checkpoint(chain, seed as i64, &hash).await?;
    info!(chain = %chain, height = seed, "seeded watcher checkpoint");
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_burn, encode_mint, BurnEvent, MintEvent};
    use crate::db::{CheckpointStore, TransferRecord};
    use crate::rpc::{CellOutput, OutPoint, TxInput};
    use crate::test_util::{InMemoryStore, MockChain};
    use crate::types::{AssetEntry, ConfirmStatus};
    use chrono::Utc;

    const OWNER_TAG: [u8; 32] = [0x11; 32];

    fn asset() -> Asset {
        Asset::new(
            AssetEntry {
                id: "src-native".to_string(),
                symbol: "SRC".to_string(),
                decimals: 8,
                in_fee: 100,
                out_fee: 200,
            },
            OWNER_TAG,
        )
    }

    fn burn_lock() -> Script {
        Script::new("0xbe", "0x00")
    }

    fn watcher(chain: Arc<MockChain>, store: Arc<InMemoryStore>) -> ShadowWatcher {
        ShadowWatcher::new(
            chain,
            store,
            ShadowWatcherConfig {
                token_code_hash: "0xaa".to_string(),
                tracking_code_hash: "0xcc".to_string(),
                burn_lock: burn_lock(),
                owner_tag_prefix: format!("0x{}", hex::encode(OWNER_TAG)),
                start_block_height: Some(1),
            },
            &[asset()],
        )
    }

    /// One-output transaction whose cell later funds another transaction.
    fn funding_tx(hash: &str, lock: Script) -> ChainTransaction {
        ChainTransaction {
            hash: hash.to_string(),
            inputs: vec![],
            outputs: vec![CellOutput {
                value: 0,
                lock,
                type_script: None,
            }],
            outputs_data: vec!["0x".to_string()],
            witnesses: vec![],
        }
    }

    fn burn_tx(
        hash: &str,
        funding_hash: &str,
        amount: u128,
        recipient: &str,
    ) -> ChainTransaction {
        let envelope = WitnessEnvelope {
            lock: None,
            input_type: Some(encode_burn(&BurnEvent {
                recipient: recipient.to_string(),
            })),
        };
        ChainTransaction {
            hash: hash.to_string(),
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    tx_hash: funding_hash.to_string(),
                    index: 0,
                },
            }],
            outputs: vec![CellOutput {
                value: 0,
                lock: burn_lock(),
                type_script: Some(Script::new("0xaa", asset().tracking_script_args())),
            }],
            outputs_data: vec![format!("0x{}", hex::encode(amount.to_le_bytes()))],
            witnesses: vec![format!("0x{}", hex::encode(envelope.encode()))],
        }
    }

    fn pending_inbound(id: &str) -> TransferRecord {
        TransferRecord {
            id: id.to_string(),
            direction: Direction::Inbound,
            source_chain: Chain::Source,
            target_chain: Chain::Shadow,
            asset: "src-native".to_string(),
            amount: "10000".to_string(),
            bridge_fee: Some("100".to_string()),
            sender: "0xdepositor".to_string(),
            recipient: "shadow1qalice".to_string(),
            source_tx_hash: id.to_string(),
            source_block_height: 1,
            confirm_count: 6,
            confirm_status: ConfirmStatus::Confirmed,
            target_tx_hash: None,
            target_tx_at: None,
            status: RecordStatus::Pending,
            message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_burn_creates_outbound_record() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        chain.commit_tx(funding_tx("0xfund", Script::new("0x99", "0xab01")), 1);
        chain.commit_tx(burn_tx("0xburn", "0xfund", 10_000, "src1qrecipient"), 2);

        assert!(watcher(chain, store.clone()).poll_once().await.unwrap());

        let record = store.record("0xburn").unwrap();
        assert_eq!(record.direction, Direction::Outbound);
        assert_eq!(record.asset, "src-native");
        assert_eq!(record.amount, "10000");
        assert_eq!(record.sender, "0xab01");
        assert_eq!(record.recipient, "src1qrecipient");
        assert_eq!(record.source_block_height, 2);
        assert_eq!(record.status, RecordStatus::Todo);
    }

    #[tokio::test]
    async fn test_replay_yields_single_record() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        chain.commit_tx(funding_tx("0xfund", Script::new("0x99", "0xab01")), 1);
        chain.commit_tx(burn_tx("0xburn", "0xfund", 10_000, "src1qrecipient"), 2);

        let watcher = watcher(chain, store.clone());
        watcher.poll_once().await.unwrap();
        assert_eq!(store.record_count(), 1);

        // a crash before the checkpoint write replays the same range
        store.set_checkpoint(Chain::Shadow, 0, "0xb000").await.unwrap();
        watcher.poll_once().await.unwrap();
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_processed_tip() {
        let chain = Arc::new(MockChain::new(3));
        let store = Arc::new(InMemoryStore::new());
        let watcher = watcher(chain.clone(), store.clone());

        assert!(watcher.poll_once().await.unwrap());
        let checkpoint = store.checkpoint(Chain::Shadow).await.unwrap().unwrap();
        assert_eq!(checkpoint.block_height, 3);
        assert_eq!(checkpoint.block_hash, "0xb003");

        // caught up with the tip: nothing processed, checkpoint untouched
        assert!(!watcher.poll_once().await.unwrap());
        let checkpoint = store.checkpoint(Chain::Shadow).await.unwrap().unwrap();
        assert_eq!(checkpoint.block_height, 3);

        chain.set_tip(5);
        assert!(watcher.poll_once().await.unwrap());
        let checkpoint = store.checkpoint(Chain::Shadow).await.unwrap().unwrap();
        assert_eq!(checkpoint.block_height, 5);
    }

    #[tokio::test]
    async fn test_committed_mint_settles_pending_inbound() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        store.put_record(pending_inbound("0xdeposit"));

        chain.commit_tx(
            funding_tx("0xtrack", Script::new("0xcc", asset().tracking_script_args())),
            1,
        );
        let envelope = WitnessEnvelope {
            lock: None,
            input_type: Some(encode_mint(&MintEvent {
                lock_ids: vec![record_lock_id("0xdeposit")],
            })),
        };
        let mint = ChainTransaction {
            hash: "0xmint".to_string(),
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    tx_hash: "0xtrack".to_string(),
                    index: 0,
                },
            }],
            outputs: vec![],
            outputs_data: vec![],
            witnesses: vec![format!("0x{}", hex::encode(envelope.encode()))],
        };
        chain.commit_tx(mint, 2);

        watcher(chain, store.clone()).poll_once().await.unwrap();

        let record = store.record("0xdeposit").unwrap();
        assert_eq!(record.status, RecordStatus::Success);
        assert_eq!(record.target_tx_hash.as_deref(), Some("0xmint"));
    }

    #[tokio::test]
    async fn test_bridge_funded_burn_is_skipped() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        chain.commit_tx(funding_tx("0xfund", burn_lock()), 1);
        chain.commit_tx(burn_tx("0xselfburn", "0xfund", 10_000, "src1qme"), 2);

        watcher(chain, store.clone()).poll_once().await.unwrap();
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_overflowing_burn_is_skipped() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        chain.commit_tx(funding_tx("0xfund", Script::new("0x99", "0xab01")), 1);
        let mut burn = burn_tx("0xburn", "0xfund", u128::MAX, "src1qrecipient");
        burn.outputs.push(burn.outputs[0].clone());
        burn.outputs_data
            .push(format!("0x{}", hex::encode(1u128.to_le_bytes())));
        chain.commit_tx(burn, 2);

        watcher(chain, store.clone()).poll_once().await.unwrap();
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_unlisted_asset_burn_is_skipped() {
        let chain = Arc::new(MockChain::new(0));
        let store = Arc::new(InMemoryStore::new());
        chain.commit_tx(funding_tx("0xfund", Script::new("0x99", "0xab01")), 1);
        let mut burn = burn_tx("0xburn", "0xfund", 10_000, "src1qrecipient");
        burn.outputs[0].type_script = Some(Script::new("0xaa", "0xdeadbeef".to_string()));
        chain.commit_tx(burn, 2);

        watcher(chain, store.clone()).poll_once().await.unwrap();
        assert_eq!(store.record_count(), 0);
    }
}
