//! Chain access seam.
//!
//! `ChainRpc` is the boundary between the relayer and a chain node. The
//! production implementation is a hand-rolled JSON-RPC client over
//! `reqwest`; tests substitute an in-memory chain.

use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::types::u128_string;

/// A lock or type script attached to a cell output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub code_hash: String,
    pub args: String,
}

impl Script {
    pub fn new(code_hash: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            code_hash: code_hash.into(),
            args: args.into(),
        }
    }
}

/// Reference to a transaction output being spent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
}

/// A transaction output: native value plus lock and optional asset type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
    #[serde(with = "u128_string")]
    pub value: u128,
    pub lock: Script,
    pub type_script: Option<Script>,
}

/// A full transaction as returned by the node.
///
/// `outputs_data` and `witnesses` are hex strings with a `0x` prefix,
/// positionally aligned with `outputs` and `inputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<CellOutput>,
    pub outputs_data: Vec<String>,
    pub witnesses: Vec<String>,
}

/// A block with its transactions, as consumed by the watchers.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockView {
    pub height: u64,
    pub hash: String,
    pub transactions: Vec<ChainTransaction>,
}

/// Where a broadcast transaction currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Node does not know the transaction.
    NotFound,
    /// Accepted into the mempool, not yet in a block.
    Pending,
    /// Included in a block at the given height.
    Committed { block_height: u64 },
}

/// A spendable cell under some lock, used for funding selection and
/// tracking-cell lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveCell {
    pub out_point: OutPoint,
    pub output: CellOutput,
    pub data: String,
}

/// Node access used by watchers, confirmation tracking, and the builders.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Height of the chain tip.
    async fn tip_height(&self) -> Result<u64>;

    /// Hash of the block at `height`.
    async fn block_hash(&self, height: u64) -> Result<String>;

    /// Full block at `height`, or `None` past the tip.
    async fn block_by_height(&self, height: u64) -> Result<Option<BlockView>>;

    /// Commitment status of a transaction by hash.
    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus>;

    /// Full transaction by hash, if the node knows it.
    async fn transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>>;

    /// Live cells under `lock`, oldest first, at most `limit`.
    async fn live_cells_by_lock(&self, lock: &Script, limit: u32) -> Result<Vec<LiveCell>>;

    /// Submit a signed transaction; returns the tx hash the node assigned.
    async fn send_transaction(&self, tx: &ChainTransaction) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TxWithStatus {
    transaction: Option<ChainTransaction>,
    status: String,
    block_height: Option<u64>,
}

/// JSON-RPC `ChainRpc` implementation.
pub struct JsonRpcChainClient {
    rpc_url: String,
    client: Client,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self { rpc_url, client })
    }

    async fn call<P: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(error) = response.error {
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }

        Ok(response.result)
    }
}

#[async_trait]
impl ChainRpc for JsonRpcChainClient {
    async fn tip_height(&self) -> Result<u64> {
        let hex: String = self
            .call("get_tip_block_number", serde_json::json!([]))
            .await?
            .ok_or_else(|| eyre!("no tip height returned"))?;
        Ok(u64::from_str_radix(hex.trim_start_matches("0x"), 16)?)
    }

    async fn block_hash(&self, height: u64) -> Result<String> {
        self.call("get_block_hash", serde_json::json!([format!("0x{height:x}")]))
            .await?
            .ok_or_else(|| eyre!("no block hash at height {height}"))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockView>> {
        self.call(
            "get_block_by_number",
            serde_json::json!([format!("0x{height:x}")]),
        )
        .await
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus> {
        let result: Option<TxWithStatus> = self
            .call("get_transaction", serde_json::json!([tx_hash]))
            .await?;

        let Some(tx) = result else {
            return Ok(TxStatus::NotFound);
        };
        match tx.status.as_str() {
            "committed" => {
                let block_height = tx
                    .block_height
                    .ok_or_else(|| eyre!("committed tx {tx_hash} missing block height"))?;
                Ok(TxStatus::Committed { block_height })
            }
            "pending" | "proposed" => Ok(TxStatus::Pending),
            _ => Ok(TxStatus::NotFound),
        }
    }

    async fn transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>> {
        let result: Option<TxWithStatus> = self
            .call("get_transaction", serde_json::json!([tx_hash]))
            .await?;
        Ok(result.and_then(|tx| tx.transaction))
    }

    async fn live_cells_by_lock(&self, lock: &Script, limit: u32) -> Result<Vec<LiveCell>> {
        let cells: Option<Vec<LiveCell>> = self
            .call(
                "get_cells",
                serde_json::json!([{
                    "script": lock,
                    "script_type": "lock",
                }, "asc", format!("0x{limit:x}")]),
            )
            .await?;
        Ok(cells.unwrap_or_default())
    }

    async fn send_transaction(&self, tx: &ChainTransaction) -> Result<String> {
        self.call("send_transaction", serde_json::json!([tx]))
            .await?
            .ok_or_else(|| eyre!("node returned no tx hash"))
    }
}
