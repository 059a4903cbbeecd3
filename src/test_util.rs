//! In-memory collaborators for exercising the pipeline without a node,
//! database, or signer fleet.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use secp256k1::SecretKey;

use crate::coordinator::{sign_recoverable, SignRequest, SignerClient};
use crate::db::{Checkpoint, CheckpointStore, NewTransferRecord, RecordStore, TransferRecord};
use crate::price::PriceSource;
use crate::rpc::{BlockView, ChainRpc, ChainTransaction, LiveCell, Script, TxStatus};
use crate::types::{Chain, Direction, RecordStatus};

#[derive(Default)]
struct StoreState {
    records: HashMap<String, TransferRecord>,
    insertion_order: Vec<String>,
    checkpoints: HashMap<Chain, Checkpoint>,
}

/// Record and checkpoint store backed by a mutex-held map.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str) -> Option<TransferRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn put_record(&self, record: TransferRecord) {
        let mut state = self.state.lock().unwrap();
        state.insertion_order.push(record.id.clone());
        state.records.insert(record.id.clone(), record);
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_record(&self, record: &NewTransferRecord) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(&record.id) {
            return Ok(false);
        }
        let now = Utc::now();
        state.insertion_order.push(record.id.clone());
        state.records.insert(
            record.id.clone(),
            TransferRecord {
                id: record.id.clone(),
                direction: record.direction,
                source_chain: record.source_chain(),
                target_chain: record.target_chain(),
                asset: record.asset.clone(),
                amount: record.amount.clone(),
                bridge_fee: None,
                sender: record.sender.clone(),
                recipient: record.recipient.clone(),
                source_tx_hash: record.source_tx_hash.clone(),
                source_block_height: record.source_block_height,
                confirm_count: 0,
                confirm_status: crate::types::ConfirmStatus::Unconfirmed,
                target_tx_hash: None,
                target_tx_at: None,
                status: RecordStatus::Todo,
                message: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn record_by_id(&self, id: &str) -> Result<Option<TransferRecord>> {
        Ok(self.record(id))
    }

    async fn records_by_status(
        &self,
        direction: Direction,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<TransferRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| {
                r.direction == direction
                    && r.status == status
                    && r.confirm_status == crate::types::ConfirmStatus::Confirmed
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn unconfirmed_records(&self, direction: Direction) -> Result<Vec<TransferRecord>> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| {
                r.direction == direction
                    && r.confirm_status == crate::types::ConfirmStatus::Unconfirmed
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.source_block_height);
        Ok(records)
    }

    async fn update_confirm_count(&self, id: &str, confirm_count: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| eyre!("no record {id}"))?;
        record.confirm_count = confirm_count;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn promote_confirmed(
        &self,
        id: &str,
        confirm_count: i32,
        bridge_fee: &str,
        status: RecordStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| eyre!("no record {id}"))?;
        if record.confirm_status == crate::types::ConfirmStatus::Unconfirmed {
            record.confirm_status = crate::types::ConfirmStatus::Confirmed;
            record.confirm_count = confirm_count;
            record.bridge_fee = Some(bridge_fee.to_string());
            record.status = status;
            record.message = message.map(str::to_string);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_pending(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                if record.status == RecordStatus::Todo {
                    record.status = RecordStatus::Pending;
                    record.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn set_target_tx(&self, id: &str, tx_hash: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| eyre!("no record {id}"))?;
        if record.target_tx_hash.is_some() {
            return Ok(false);
        }
        record.target_tx_hash = Some(tx_hash.to_string());
        record.target_tx_at = Some(Utc::now());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn requeue(&self, id: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| eyre!("no record {id}"))?;
        if record.status == RecordStatus::Pending {
            record.status = RecordStatus::Todo;
            record.target_tx_hash = None;
            record.target_tx_at = None;
            record.message = Some(message.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        status: RecordStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| eyre!("no record {id}"))?;
        record.status = status;
        record.message = message.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn transfer_history(&self, account: &str, asset: &str) -> Result<Vec<TransferRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .values()
            .filter(|r| (r.sender == account || r.recipient == account) && r.asset == asset)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn checkpoint(&self, chain: Chain) -> Result<Option<Checkpoint>> {
        Ok(self.state.lock().unwrap().checkpoints.get(&chain).cloned())
    }

    async fn set_checkpoint(
        &self,
        chain: Chain,
        block_height: i64,
        block_hash: &str,
    ) -> Result<()> {
        self.state.lock().unwrap().checkpoints.insert(
            chain,
            Checkpoint {
                chain,
                block_height,
                block_hash: block_hash.to_string(),
            },
        );
        Ok(())
    }
}

#[derive(Default)]
struct ChainState {
    tip: u64,
    blocks: HashMap<u64, BlockView>,
    transactions: HashMap<String, ChainTransaction>,
    statuses: HashMap<String, TxStatus>,
    cells: Vec<LiveCell>,
    sent: Vec<ChainTransaction>,
}

/// Scriptable chain double. Broadcast transactions are committed
/// immediately at the current tip unless `auto_commit` is turned off.
pub struct MockChain {
    state: Mutex<ChainState>,
    pub auto_commit: bool,
}

impl MockChain {
    pub fn new(tip: u64) -> Self {
        let chain = Self {
            state: Mutex::new(ChainState {
                tip,
                ..Default::default()
            }),
            auto_commit: true,
        };
        for height in 0..=tip {
            chain.push_empty_block(height);
        }
        chain
    }

    fn push_empty_block(&self, height: u64) {
        self.state.lock().unwrap().blocks.insert(
            height,
            BlockView {
                height,
                hash: format!("0xb{height:03x}"),
                transactions: vec![],
            },
        );
    }

    pub fn set_tip(&self, tip: u64) {
        let mut state = self.state.lock().unwrap();
        for height in (state.tip + 1)..=tip {
            state.blocks.entry(height).or_insert(BlockView {
                height,
                hash: format!("0xb{height:03x}"),
                transactions: vec![],
            });
        }
        state.tip = tip;
    }

    /// Place a transaction into the block at `height` (extending the tip if
    /// needed), mark it committed, and roll the live-cell set forward.
    pub fn commit_tx(&self, tx: ChainTransaction, height: u64) {
        let tip = self.state.lock().unwrap().tip;
        self.set_tip(tip.max(height));
        let mut state = self.state.lock().unwrap();
        state
            .statuses
            .insert(tx.hash.clone(), TxStatus::Committed { block_height: height });
        state
            .blocks
            .get_mut(&height)
            .unwrap()
            .transactions
            .push(tx.clone());

        let spent: Vec<_> = tx
            .inputs
            .iter()
            .map(|input| input.previous_output.clone())
            .collect();
        state.cells.retain(|cell| !spent.contains(&cell.out_point));
        for (index, (output, data)) in tx.outputs.iter().zip(&tx.outputs_data).enumerate() {
            state.cells.push(LiveCell {
                out_point: crate::rpc::OutPoint {
                    tx_hash: tx.hash.clone(),
                    index: index as u32,
                },
                output: output.clone(),
                data: data.clone(),
            });
        }

        state.transactions.insert(tx.hash.clone(), tx);
    }

    pub fn add_cell(&self, cell: LiveCell) {
        self.state.lock().unwrap().cells.push(cell);
    }

    pub fn sent_transactions(&self) -> Vec<ChainTransaction> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn tip_height(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().tip)
    }

    async fn block_hash(&self, height: u64) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or_else(|| eyre!("no block at {height}"))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockView>> {
        Ok(self.state.lock().unwrap().blocks.get(&height).cloned())
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(tx_hash)
            .cloned()
            .unwrap_or(TxStatus::NotFound))
    }

    async fn transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>> {
        Ok(self.state.lock().unwrap().transactions.get(tx_hash).cloned())
    }

    async fn live_cells_by_lock(&self, lock: &Script, limit: u32) -> Result<Vec<LiveCell>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cells
            .iter()
            .filter(|cell| &cell.output.lock == lock)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn send_transaction(&self, tx: &ChainTransaction) -> Result<String> {
        let tip = {
            let mut state = self.state.lock().unwrap();
            state.sent.push(tx.clone());
            state.transactions.insert(tx.hash.clone(), tx.clone());
            state
                .statuses
                .insert(tx.hash.clone(), TxStatus::Pending);
            state.tip
        };
        if self.auto_commit {
            self.commit_tx(tx.clone(), tip + 1);
        }
        Ok(tx.hash.clone())
    }
}

/// Signer double holding real keys per endpoint; endpoints containing
/// "down" refuse to sign.
pub struct KeyedSigner {
    keys: HashMap<String, SecretKey>,
}

impl KeyedSigner {
    pub fn new(keys: HashMap<String, SecretKey>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl SignerClient for KeyedSigner {
    async fn request_signature(&self, endpoint: &str, request: &SignRequest) -> Result<Vec<u8>> {
        if endpoint.contains("down") {
            return Err(eyre!("connection refused"));
        }
        let secret = self
            .keys
            .get(endpoint)
            .ok_or_else(|| eyre!("no key for {endpoint}"))?;
        let digest_bytes = crate::types::decode_hex(&request.digest)?;
        let digest: [u8; 32] = digest_bytes
            .try_into()
            .map_err(|_| eyre!("digest must be 32 bytes"))?;
        Ok(sign_recoverable(secret, &digest).to_vec())
    }
}

/// Fixed-price source.
pub struct FixedPrice(pub f64);

#[async_trait]
impl PriceSource for FixedPrice {
    async fn price_usd(&self, _symbol: &str) -> Result<f64> {
        Ok(self.0)
    }
}
