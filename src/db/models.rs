use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{Chain, ConfirmStatus, Direction, RecordStatus};

// Amounts are stored as NUMERIC(39,0) and carried as String here to avoid
// BigDecimal/sqlx version conflicts. Inserts cast text to NUMERIC in the SQL
// ($1::NUMERIC); selects cast back (amount::TEXT as amount).

/// A transfer record, the unit of bridge accounting.
///
/// `id` is the detection-side tx hash, suffixed with `-<index>` when a single
/// unlock transaction settles several burns.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub direction: Direction,
    pub source_chain: Chain,
    pub target_chain: Chain,
    pub asset: String,
    pub amount: String,
    pub bridge_fee: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub source_tx_hash: String,
    pub source_block_height: i64,
    pub confirm_count: i32,
    pub confirm_status: ConfirmStatus,
    pub target_tx_hash: Option<String>,
    pub target_tx_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Parsed transfer amount, smallest unit.
    pub fn amount_u128(&self) -> eyre::Result<u128> {
        self.amount
            .parse()
            .map_err(|e| eyre::eyre!("record {} has bad amount {:?}: {e}", self.id, self.amount))
    }

    /// Parsed bridge fee, once the confirmation pass has priced it.
    pub fn bridge_fee_u128(&self) -> eyre::Result<Option<u128>> {
        self.bridge_fee
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|e| {
                    eyre::eyre!("record {} has bad bridge_fee {:?}: {e}", self.id, raw)
                })
            })
            .transpose()
    }
}

/// For inserting newly detected transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransferRecord {
    pub id: String,
    pub direction: Direction,
    pub asset: String,
    pub amount: String,
    pub sender: String,
    pub recipient: String,
    pub source_tx_hash: String,
    pub source_block_height: i64,
}

impl NewTransferRecord {
    pub fn source_chain(&self) -> Chain {
        match self.direction {
            Direction::Inbound => Chain::Source,
            Direction::Outbound => Chain::Shadow,
        }
    }

    pub fn target_chain(&self) -> Chain {
        self.source_chain().opposite()
    }
}

/// Per-chain watcher progress pointer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain: Chain,
    pub block_height: i64,
    pub block_hash: String,
}
