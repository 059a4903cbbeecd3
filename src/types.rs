//! Common types for the relay pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

/// The two chains the bridge relays between.
///
/// The source chain holds the real asset in the multisig escrow; the shadow
/// chain carries the minted shadow tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Source,
    Shadow,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Source => "source",
            Chain::Shadow => "shadow",
        }
    }

    /// The chain on the other side of the bridge.
    pub fn opposite(&self) -> Chain {
        match self {
            Chain::Source => Chain::Shadow,
            Chain::Shadow => Chain::Source,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transfer direction as seen from the bridge.
///
/// Inbound: deposit detected on the source chain, a mint is owed on the
/// shadow chain. Outbound: burn detected on the shadow chain, an unlock is
/// owed on the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing status of a transfer record.
///
/// `Success` is terminal. `Error` and `ManualReview` are terminal for
/// automatic processing and require operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum RecordStatus {
    #[sqlx(rename = "todo")]
    #[serde(rename = "todo")]
    Todo,
    #[sqlx(rename = "pending")]
    #[serde(rename = "pending")]
    Pending,
    #[sqlx(rename = "success")]
    #[serde(rename = "success")]
    Success,
    #[sqlx(rename = "error")]
    #[serde(rename = "error")]
    Error,
    #[sqlx(rename = "manual-review")]
    #[serde(rename = "manual-review")]
    ManualReview,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Todo => "todo",
            RecordStatus::Pending => "pending",
            RecordStatus::Success => "success",
            RecordStatus::Error => "error",
            RecordStatus::ManualReview => "manual-review",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Confirmation status of the detection-side transaction behind a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Unconfirmed,
    Confirmed,
}

impl ConfirmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmStatus::Unconfirmed => "unconfirmed",
            ConfirmStatus::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for ConfirmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Allow-list entry for a bridgeable asset.
///
/// Amounts are in the asset's smallest unit. Fees are flat per-transfer fees
/// set by the operator, not a percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Chain-native asset identifier.
    pub id: String,
    /// Human symbol used for price lookups.
    pub symbol: String,
    /// Decimals of the smallest unit.
    pub decimals: u32,
    /// Fee withheld from a mint (inbound transfer), smallest unit.
    #[serde(with = "u128_string")]
    pub in_fee: u128,
    /// Fee withheld from an unlock (outbound transfer), smallest unit.
    #[serde(with = "u128_string")]
    pub out_fee: u128,
}

/// u128 amounts serialize as decimal strings; JSON numbers lose precision
/// past 2^53.
pub mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A bridgeable asset: its allow-list entry tagged with the owner identity
/// that scopes the bridge's on-chain tracking lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub entry: AssetEntry,
    owner_tag: [u8; 32],
}

impl Asset {
    pub fn new(entry: AssetEntry, owner_tag: [u8; 32]) -> Self {
        Self { entry, owner_tag }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    /// Fee withheld for a transfer in the given direction.
    pub fn bridge_fee(&self, direction: Direction) -> u128 {
        match direction {
            Direction::Inbound => self.entry.in_fee,
            Direction::Outbound => self.entry.out_fee,
        }
    }

    /// Args of the bridge tracking lock for this asset: the owner tag
    /// followed by the hash of the asset id. Uniquely identifies the
    /// tracking cell holding this asset's mint accounting.
    pub fn tracking_script_args(&self) -> String {
        let mut args = Vec::with_capacity(64);
        args.extend_from_slice(&self.owner_tag);
        args.extend_from_slice(&keccak256(self.entry.id.as_bytes()));
        format!("0x{}", hex::encode(args))
    }
}

/// keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// Strip an optional `0x` prefix and decode hex.
pub fn decode_hex(raw: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
}
