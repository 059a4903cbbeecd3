//! Deterministic deposit-address derivation.
//!
//! Each shadow-chain identity gets its own source-chain deposit script,
//! derived from the verifier multisig and the identity hash. The derivation
//! is pure, so provisioning a deposit address needs no chain interaction and
//! two parties always agree on the result.

use crate::rpc::Script;
use crate::tx::MultisigConfig;
use crate::types::keccak256;

/// Derive the deposit script for a shadow identity: args are the first 20
/// bytes of `keccak(multisig_script || keccak(identity))`.
pub fn derive_deposit_address(
    multisig: &MultisigConfig,
    deposit_code_hash: &str,
    shadow_identity: &str,
) -> Script {
    let mut preimage = multisig.serialized_script();
    preimage.extend_from_slice(&keccak256(shadow_identity.as_bytes()));
    let hash = keccak256(&preimage);
    Script::new(deposit_code_hash, format!("0x{}", hex::encode(&hash[..20])))
}
