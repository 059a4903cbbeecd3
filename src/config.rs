use eyre::{eyre, Result, WrapErr};
use secp256k1::{PublicKey, SecretKey};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::coordinator::Verifier;
use crate::rpc::Script;
use crate::tx::MultisigConfig;
use crate::types::{decode_hex, Asset, AssetEntry};

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceChainConfig,
    pub shadow: ShadowChainConfig,
    pub signers: SignerSetConfig,
    pub relayer: RelayerConfig,
    /// Asset allow-list; transfers of anything else are rejected.
    pub assets: Vec<AssetEntry>,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Source-chain configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceChainConfig {
    pub rpc_url: String,
    /// Escrow lock holding deposited funds; its args must match the
    /// configured verifier multisig.
    pub escrow_code_hash: String,
    pub escrow_args: String,
    /// Lock code hash unlock payouts resolve recipients under.
    pub recipient_code_hash: String,
    /// Asset id deposits of the escrowed native asset are recorded under.
    pub native_asset_id: String,
    #[serde(default = "default_source_confirmations")]
    pub required_confirmations: i32,
    #[serde(default)]
    pub start_block_height: Option<u64>,
}

/// Shadow-chain configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShadowChainConfig {
    pub rpc_url: String,
    /// Type script code hash of the shadow token.
    pub token_code_hash: String,
    /// Lock code hash of the bridge tracking cells.
    pub tracking_code_hash: String,
    /// Lock code hash mint outputs resolve recipients under.
    pub recipient_code_hash: String,
    /// Lock burns park shadow tokens in.
    pub burn_lock_code_hash: String,
    pub burn_lock_args: String,
    /// Hot-key lock funding tracking-cell creation.
    pub funding_lock_code_hash: String,
    pub funding_lock_args: String,
    /// 32-byte owner tag prefixing every tracking-lock args, hex.
    pub owner_tag: String,
    /// Required prefix of shadow recipient addresses in deposit memos.
    pub address_prefix: String,
    #[serde(default = "default_shadow_confirmations")]
    pub required_confirmations: i32,
    #[serde(default)]
    pub start_block_height: Option<u64>,
}

/// Verifier set configuration
#[derive(Clone, Deserialize)]
pub struct SignerSetConfig {
    /// Signing endpoints, one per verifier, same order as `pubkeys`.
    pub endpoints: Vec<String>,
    /// Compressed public keys, hex.
    pub pubkeys: Vec<String>,
    pub threshold: usize,
    #[serde(default)]
    pub multisig_flags: u8,
    /// Relayer hot key, hex.
    pub hot_key: String,
}

/// Custom Debug that redacts the hot key to prevent accidental log leakage.
impl fmt::Debug for SignerSetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerSetConfig")
            .field("endpoints", &self.endpoints)
            .field("pubkeys", &self.pubkeys)
            .field("threshold", &self.threshold)
            .field("multisig_flags", &self.multisig_flags)
            .field("hot_key", &"<redacted>")
            .finish()
    }
}

/// Relayer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_mint_batch_limit")]
    pub mint_batch_limit: i64,
    /// Confirmed transfers valued above this go to manual review.
    #[serde(default = "default_audit_threshold_usd")]
    pub audit_threshold_usd: f64,
    pub price_api_url: String,
    #[serde(default = "default_price_cache_ttl_secs")]
    pub price_cache_ttl_secs: u64,
}

/// Default functions
fn default_source_confirmations() -> i32 {
    6
}

fn default_shadow_confirmations() -> i32 {
    15
}

fn default_mint_batch_limit() -> i64 {
    100
}

fn default_audit_threshold_usd() -> f64 {
    10_000.0
}

fn default_price_cache_ttl_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let source = SourceChainConfig {
            rpc_url: env::var("SOURCE_RPC_URL")
                .map_err(|_| eyre!("SOURCE_RPC_URL environment variable is required"))?,
            escrow_code_hash: env::var("SOURCE_ESCROW_CODE_HASH")
                .map_err(|_| eyre!("SOURCE_ESCROW_CODE_HASH environment variable is required"))?,
            escrow_args: env::var("SOURCE_ESCROW_ARGS")
                .map_err(|_| eyre!("SOURCE_ESCROW_ARGS environment variable is required"))?,
            recipient_code_hash: env::var("SOURCE_RECIPIENT_CODE_HASH").map_err(|_| {
                eyre!("SOURCE_RECIPIENT_CODE_HASH environment variable is required")
            })?,
            native_asset_id: env::var("SOURCE_NATIVE_ASSET_ID")
                .map_err(|_| eyre!("SOURCE_NATIVE_ASSET_ID environment variable is required"))?,
            required_confirmations: env::var("SOURCE_CONFIRMATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_source_confirmations()),
            start_block_height: env::var("SOURCE_START_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok()),
        };

        let shadow = ShadowChainConfig {
            rpc_url: env::var("SHADOW_RPC_URL")
                .map_err(|_| eyre!("SHADOW_RPC_URL environment variable is required"))?,
            token_code_hash: env::var("SHADOW_TOKEN_CODE_HASH")
                .map_err(|_| eyre!("SHADOW_TOKEN_CODE_HASH environment variable is required"))?,
            tracking_code_hash: env::var("SHADOW_TRACKING_CODE_HASH").map_err(|_| {
                eyre!("SHADOW_TRACKING_CODE_HASH environment variable is required")
            })?,
            recipient_code_hash: env::var("SHADOW_RECIPIENT_CODE_HASH").map_err(|_| {
                eyre!("SHADOW_RECIPIENT_CODE_HASH environment variable is required")
            })?,
            burn_lock_code_hash: env::var("SHADOW_BURN_LOCK_CODE_HASH").map_err(|_| {
                eyre!("SHADOW_BURN_LOCK_CODE_HASH environment variable is required")
            })?,
            burn_lock_args: env::var("SHADOW_BURN_LOCK_ARGS")
                .map_err(|_| eyre!("SHADOW_BURN_LOCK_ARGS environment variable is required"))?,
            funding_lock_code_hash: env::var("SHADOW_FUNDING_LOCK_CODE_HASH").map_err(|_| {
                eyre!("SHADOW_FUNDING_LOCK_CODE_HASH environment variable is required")
            })?,
            funding_lock_args: env::var("SHADOW_FUNDING_LOCK_ARGS").map_err(|_| {
                eyre!("SHADOW_FUNDING_LOCK_ARGS environment variable is required")
            })?,
            owner_tag: env::var("SHADOW_OWNER_TAG")
                .map_err(|_| eyre!("SHADOW_OWNER_TAG environment variable is required"))?,
            address_prefix: env::var("SHADOW_ADDRESS_PREFIX")
                .map_err(|_| eyre!("SHADOW_ADDRESS_PREFIX environment variable is required"))?,
            required_confirmations: env::var("SHADOW_CONFIRMATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_shadow_confirmations()),
            start_block_height: env::var("SHADOW_START_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok()),
        };

        let signers = SignerSetConfig {
            endpoints: env::var("SIGNER_ENDPOINTS")
                .map_err(|_| eyre!("SIGNER_ENDPOINTS environment variable is required"))?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            pubkeys: env::var("SIGNER_PUBKEYS")
                .map_err(|_| eyre!("SIGNER_PUBKEYS environment variable is required"))?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            threshold: env::var("SIGNER_THRESHOLD")
                .map_err(|_| eyre!("SIGNER_THRESHOLD environment variable is required"))?
                .parse()
                .wrap_err("SIGNER_THRESHOLD must be a valid usize")?,
            multisig_flags: env::var("MULTISIG_FLAGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            hot_key: env::var("HOT_KEY")
                .map_err(|_| eyre!("HOT_KEY environment variable is required"))?,
        };

        let relayer = RelayerConfig {
            mint_batch_limit: env::var("MINT_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_mint_batch_limit()),
            audit_threshold_usd: env::var("AUDIT_THRESHOLD_USD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_audit_threshold_usd()),
            price_api_url: env::var("PRICE_API_URL")
                .map_err(|_| eyre!("PRICE_API_URL environment variable is required"))?,
            price_cache_ttl_secs: env::var("PRICE_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_price_cache_ttl_secs()),
        };

        let assets: Vec<AssetEntry> = serde_json::from_str(
            &env::var("ASSET_ALLOWLIST")
                .map_err(|_| eyre!("ASSET_ALLOWLIST environment variable is required"))?,
        )
        .wrap_err("ASSET_ALLOWLIST must be a JSON array of asset entries")?;

        let config = Config {
            database,
            source,
            shadow,
            signers,
            relayer,
            assets,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.source.rpc_url.is_empty() {
            return Err(eyre!("source.rpc_url cannot be empty"));
        }
        if self.shadow.rpc_url.is_empty() {
            return Err(eyre!("shadow.rpc_url cannot be empty"));
        }
        if self.shadow.address_prefix.is_empty() {
            return Err(eyre!("shadow.address_prefix cannot be empty"));
        }
        if self.relayer.price_api_url.is_empty() {
            return Err(eyre!("relayer.price_api_url cannot be empty"));
        }
        if self.relayer.audit_threshold_usd <= 0.0 {
            return Err(eyre!("relayer.audit_threshold_usd must be positive"));
        }

        if self.assets.is_empty() {
            return Err(eyre!("asset allow-list cannot be empty"));
        }
        if !self
            .assets
            .iter()
            .any(|entry| entry.id == self.source.native_asset_id)
        {
            return Err(eyre!(
                "source.native_asset_id {} is missing from the asset allow-list",
                self.source.native_asset_id
            ));
        }

        if self.signers.endpoints.len() != self.signers.pubkeys.len() {
            return Err(eyre!(
                "signers.endpoints ({}) and signers.pubkeys ({}) must pair up",
                self.signers.endpoints.len(),
                self.signers.pubkeys.len()
            ));
        }
        if self.signers.threshold == 0 || self.signers.threshold > self.signers.pubkeys.len() {
            return Err(eyre!(
                "signers.threshold must be between 1 and {}",
                self.signers.pubkeys.len()
            ));
        }
        if self.signers.hot_key.len() != 66 || !self.signers.hot_key.starts_with("0x") {
            return Err(eyre!("signers.hot_key must be 66 chars (0x + 64 hex chars)"));
        }
        self.hot_key()?;

        let tag = decode_hex(&self.shadow.owner_tag)
            .wrap_err("shadow.owner_tag must be valid hex")?;
        if tag.len() != 32 {
            return Err(eyre!(
                "shadow.owner_tag must be 32 bytes, got {}",
                tag.len()
            ));
        }

        // The escrow address must be the one the configured verifier keys
        // produce; a mismatch means funds would be unlocked from (or locked
        // to) an escrow this signer set cannot spend.
        let derived = self.multisig_config()?.lock_args();
        if derived != self.source.escrow_args {
            return Err(eyre!(
                "FATAL: escrow lock args {} do not match the multisig derived from \
                 the configured verifier keys ({derived}). Deposits would be \
                 unspendable by this signer set. Fix SOURCE_ESCROW_ARGS or the \
                 verifier key list.",
                self.source.escrow_args
            ));
        }

        Ok(())
    }

    pub fn multisig_config(&self) -> Result<MultisigConfig> {
        let pubkeys = self
            .signers
            .pubkeys
            .iter()
            .map(|hex_key| {
                PublicKey::from_str(hex_key.trim_start_matches("0x"))
                    .map_err(|e| eyre!("invalid verifier pubkey {hex_key}: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MultisigConfig {
            flags: self.signers.multisig_flags,
            threshold: self.signers.threshold as u8,
            pubkeys,
        })
    }

    pub fn verifiers(&self) -> Result<Vec<Verifier>> {
        let multisig = self.multisig_config()?;
        Ok(self
            .signers
            .endpoints
            .iter()
            .zip(multisig.pubkeys)
            .map(|(endpoint, pubkey)| Verifier {
                endpoint: endpoint.clone(),
                pubkey,
            })
            .collect())
    }

    pub fn hot_key(&self) -> Result<SecretKey> {
        let raw = decode_hex(&self.signers.hot_key)?;
        SecretKey::from_slice(&raw).map_err(|e| eyre!("invalid hot key: {e}"))
    }

    pub fn owner_tag(&self) -> Result<[u8; 32]> {
        let raw = decode_hex(&self.shadow.owner_tag)?;
        raw.try_into()
            .map_err(|_| eyre!("shadow.owner_tag must be 32 bytes"))
    }

    /// Allow-listed assets bound to the configured owner tag.
    pub fn asset_list(&self) -> Result<Vec<Asset>> {
        let tag = self.owner_tag()?;
        Ok(self
            .assets
            .iter()
            .map(|entry| Asset::new(entry.clone(), tag))
            .collect())
    }

    pub fn escrow_lock(&self) -> Script {
        Script::new(
            self.source.escrow_code_hash.clone(),
            self.source.escrow_args.clone(),
        )
    }

    pub fn burn_lock(&self) -> Script {
        Script::new(
            self.shadow.burn_lock_code_hash.clone(),
            self.shadow.burn_lock_args.clone(),
        )
    }

    pub fn funding_lock(&self) -> Script {
        Script::new(
            self.shadow.funding_lock_code_hash.clone(),
            self.shadow.funding_lock_args.clone(),
        )
    }
}
