//! Deterministic transaction assembly and sealing.
//!
//! Builders produce an `UnsignedTx` whose byte serialization is a pure
//! function of the batch: records are sorted by id before assembly, so the
//! same confirmed set always yields the same unsigned bytes, the same
//! digests, and the same transaction hash. Two digests are derived from the
//! unsigned bytes under distinct domain tags: one signed locally by the
//! relayer hot key, one fanned out to the verifier set.

use eyre::{eyre, Result};
use secp256k1::PublicKey;

use crate::codec::{self, WitnessEnvelope};
use crate::coordinator::Signature65;
use crate::db::TransferRecord;
use crate::rpc::{CellOutput, ChainTransaction, LiveCell, Script, TxInput};
use crate::types::{decode_hex, keccak256, Asset, Direction};

const HOTKEY_DOMAIN: &[u8] = b"shadowbridge-hotkey-v1";
const MULTISIG_DOMAIN: &[u8] = b"shadowbridge-multisig-v1";

/// Most records one unlock transaction can settle; bounded by the embedded
/// record-id data output.
pub const MAX_UNLOCK_BATCH: usize = 2;

/// The verifier multisig: serialization layout is
/// `flags | threshold | pubkey_count | pubkeys...` with 33-byte compressed
/// keys in configured order.
#[derive(Debug, Clone)]
pub struct MultisigConfig {
    pub flags: u8,
    pub threshold: u8,
    pub pubkeys: Vec<PublicKey>,
}

impl MultisigConfig {
    pub fn serialized_script(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + 33 * self.pubkeys.len());
        out.push(self.flags);
        out.push(self.threshold);
        out.push(self.pubkeys.len() as u8);
        for key in &self.pubkeys {
            out.extend_from_slice(&key.serialize());
        }
        out
    }

    /// Lock args the escrow address must carry: first 20 bytes of the script
    /// hash.
    pub fn lock_args(&self) -> String {
        let hash = keccak256(&self.serialized_script());
        format!("0x{}", hex::encode(&hash[..20]))
    }

    /// Full multisig witness: the script followed by exactly `threshold`
    /// signatures in verifier order.
    pub fn witness(&self, signatures: &[Signature65]) -> Result<Vec<u8>> {
        if signatures.len() != self.threshold as usize {
            return Err(eyre!(
                "multisig witness needs {} signatures, got {}",
                self.threshold,
                signatures.len()
            ));
        }
        let mut out = self.serialized_script();
        for signature in signatures {
            out.extend_from_slice(signature);
        }
        Ok(out)
    }
}

/// 32-byte id embedded on-chain for a transfer record.
pub fn record_lock_id(record_id: &str) -> [u8; 32] {
    keccak256(record_id.as_bytes())
}

/// An assembled but unsigned transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<CellOutput>,
    pub outputs_data: Vec<String>,
    /// Bridge event destined for witness 0's `input_type` slot.
    pub event_payload: Option<Vec<u8>>,
}

impl UnsignedTx {
    /// Canonical byte serialization. Length-prefixed throughout so distinct
    /// transactions can never serialize identically.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            let hash = decode_hex(&input.previous_output.tx_hash)?;
            out.extend_from_slice(&(hash.len() as u32).to_le_bytes());
            out.extend_from_slice(&hash);
            out.extend_from_slice(&input.previous_output.index.to_le_bytes());
        }

        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_script(&mut out, &output.lock)?;
            match &output.type_script {
                Some(script) => {
                    out.push(1);
                    write_script(&mut out, script)?;
                }
                None => out.push(0),
            }
        }

        out.extend_from_slice(&(self.outputs_data.len() as u32).to_le_bytes());
        for data in &self.outputs_data {
            let bytes = decode_hex(data)?;
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }

        match &self.event_payload {
            Some(payload) => {
                out.push(1);
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            None => out.push(0),
        }

        Ok(out)
    }

    /// Transaction hash: keccak of the unsigned bytes, stable across signing.
    pub fn hash(&self) -> Result<String> {
        Ok(format!(
            "0x{}",
            hex::encode(keccak256(&self.unsigned_bytes()?))
        ))
    }

    /// Digest the relayer hot key signs.
    pub fn hotkey_digest(&self) -> Result<[u8; 32]> {
        self.domain_digest(HOTKEY_DOMAIN)
    }

    /// Digest the verifier set signs.
    pub fn multisig_digest(&self) -> Result<[u8; 32]> {
        self.domain_digest(MULTISIG_DOMAIN)
    }

    fn domain_digest(&self, domain: &[u8]) -> Result<[u8; 32]> {
        let mut preimage = domain.to_vec();
        preimage.extend_from_slice(&self.unsigned_bytes()?);
        Ok(keccak256(&preimage))
    }

    /// Attach the local signature, the collected multisig witness, and the
    /// event payload; yields the broadcastable transaction.
    pub fn seal(
        &self,
        local_signature: &Signature65,
        multisig_witness: Option<Vec<u8>>,
    ) -> Result<ChainTransaction> {
        let mut witnesses = vec![format!(
            "0x{}",
            hex::encode(
                WitnessEnvelope {
                    lock: Some(local_signature.to_vec()),
                    input_type: self.event_payload.clone(),
                }
                .encode()
            )
        )];
        if let Some(witness) = multisig_witness {
            witnesses.push(format!(
                "0x{}",
                hex::encode(
                    WitnessEnvelope {
                        lock: Some(witness),
                        input_type: None,
                    }
                    .encode()
                )
            ));
        }
        while witnesses.len() < self.inputs.len() {
            witnesses.push("0x".to_string());
        }

        Ok(ChainTransaction {
            hash: self.hash()?,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            outputs_data: self.outputs_data.clone(),
            witnesses,
        })
    }
}

fn write_script(out: &mut Vec<u8>, script: &Script) -> Result<()> {
    let code_hash = decode_hex(&script.code_hash)?;
    out.extend_from_slice(&(code_hash.len() as u32).to_le_bytes());
    out.extend_from_slice(&code_hash);
    let args = decode_hex(&script.args)?;
    out.extend_from_slice(&(args.len() as u32).to_le_bytes());
    out.extend_from_slice(&args);
    Ok(())
}

/// Sorted working copy of a batch. All builders start here so batch order
/// never depends on query order.
fn sorted_batch(records: &[TransferRecord]) -> Vec<TransferRecord> {
    let mut batch = records.to_vec();
    batch.sort_by(|a, b| a.id.cmp(&b.id));
    batch
}

/// Net amount a record settles for, after the priced fee.
fn settled_amount(record: &TransferRecord, direction: Direction) -> Result<u128> {
    let amount = record.amount_u128()?;
    let fee = record
        .bridge_fee_u128()?
        .ok_or_else(|| eyre!("record {} has no priced fee", record.id))?;
    if amount <= fee {
        return Err(eyre!(
            "record {} amount {amount} does not cover {direction} fee {fee}",
            record.id
        ));
    }
    Ok(amount - fee)
}

/// Mint transaction: consumes the asset's tracking cell and issues one
/// shadow-token cell per confirmed deposit, net of the inbound fee. The mint
/// event embeds the deposit tx ids the mint covers.
pub fn build_mint_tx(
    asset: &Asset,
    tracking_cell: &LiveCell,
    token_code_hash: &str,
    recipient_code_hash: &str,
    records: &[TransferRecord],
) -> Result<UnsignedTx> {
    if records.is_empty() {
        return Err(eyre!("mint batch is empty"));
    }
    let batch = sorted_batch(records);

    let mut minted_total: u128 = 0;
    let mut outputs = Vec::with_capacity(batch.len() + 1);
    let mut outputs_data = Vec::with_capacity(batch.len() + 1);
    let mut lock_ids = Vec::with_capacity(batch.len());

    // output 0 carries the tracking cell forward with its running total
    let prior_total = codec::read_amount(&decode_hex(&tracking_cell.data)?)?;
    outputs.push(tracking_cell.output.clone());
    outputs_data.push(String::new()); // patched below once the total is known

    for record in &batch {
        let minted = settled_amount(record, Direction::Inbound)?;
        minted_total = minted_total
            .checked_add(minted)
            .ok_or_else(|| eyre!("mint total overflow"))?;
        outputs.push(CellOutput {
            value: 0,
            lock: Script::new(recipient_code_hash, record.recipient.clone()),
            type_script: Some(Script::new(
                token_code_hash,
                asset.tracking_script_args(),
            )),
        });
        outputs_data.push(format!("0x{}", hex::encode(minted.to_le_bytes())));
        lock_ids.push(record_lock_id(&record.id));
    }

    let new_total = prior_total
        .checked_add(minted_total)
        .ok_or_else(|| eyre!("tracking total overflow"))?;
    outputs_data[0] = format!("0x{}", hex::encode(new_total.to_le_bytes()));

    Ok(UnsignedTx {
        inputs: vec![TxInput {
            previous_output: tracking_cell.out_point.clone(),
        }],
        outputs,
        outputs_data,
        event_payload: Some(codec::encode_mint(&codec::MintEvent { lock_ids })),
    })
}

/// Unlock transaction: spends escrow cells and pays each burn's recipient
/// net of the outbound fee. Change returns to the escrow lock carrying the
/// settled record ids in its data output.
pub fn build_unlock_tx(
    escrow_lock: &Script,
    escrow_cells: &[LiveCell],
    recipient_code_hash: &str,
    records: &[TransferRecord],
) -> Result<UnsignedTx> {
    if records.is_empty() {
        return Err(eyre!("unlock batch is empty"));
    }
    if records.len() > MAX_UNLOCK_BATCH {
        return Err(eyre!(
            "unlock batch of {} exceeds maximum {MAX_UNLOCK_BATCH}",
            records.len()
        ));
    }
    let batch = sorted_batch(records);

    let mut payout_total: u128 = 0;
    let mut outputs = Vec::with_capacity(batch.len() + 1);
    let mut outputs_data = Vec::with_capacity(batch.len() + 1);
    let mut record_ids = Vec::with_capacity(batch.len());

    for record in &batch {
        let payout = settled_amount(record, Direction::Outbound)?;
        payout_total = payout_total
            .checked_add(payout)
            .ok_or_else(|| eyre!("unlock total overflow"))?;
        outputs.push(CellOutput {
            value: payout,
            lock: Script::new(recipient_code_hash, record.recipient.clone()),
            type_script: None,
        });
        outputs_data.push("0x".to_string());
        record_ids.push(record_lock_id(&record.id));
    }

    let (selected, selected_total) = select_escrow_cells(escrow_cells, payout_total)?;

    outputs.push(CellOutput {
        value: selected_total - payout_total,
        lock: escrow_lock.clone(),
        type_script: None,
    });
    outputs_data.push(format!(
        "0x{}",
        hex::encode(codec::encode_unlock_ids(&record_ids)?)
    ));

    Ok(UnsignedTx {
        inputs: selected
            .iter()
            .map(|cell| TxInput {
                previous_output: cell.out_point.clone(),
            })
            .collect(),
        outputs,
        outputs_data,
        event_payload: None,
    })
}

/// Tracking-cell bootstrap for an asset the bridge has not minted before.
/// Spends one funding cell and creates the tracking cell with a zero total.
pub fn build_tracking_tx(
    asset: &Asset,
    funding_cell: &LiveCell,
    tracking_code_hash: &str,
) -> Result<UnsignedTx> {
    Ok(UnsignedTx {
        inputs: vec![TxInput {
            previous_output: funding_cell.out_point.clone(),
        }],
        outputs: vec![
            CellOutput {
                value: 0,
                lock: Script::new(tracking_code_hash, asset.tracking_script_args()),
                type_script: None,
            },
            // remainder stays under the funding lock
            funding_cell.output.clone(),
        ],
        outputs_data: vec![
            format!("0x{}", hex::encode(0u128.to_le_bytes())),
            "0x".to_string(),
        ],
        event_payload: None,
    })
}

/// Accumulate escrow cells, oldest first, until `required` is covered.
pub fn select_escrow_cells(
    cells: &[LiveCell],
    required: u128,
) -> Result<(Vec<LiveCell>, u128)> {
    let mut selected = Vec::new();
    let mut total: u128 = 0;
    for cell in cells {
        if total >= required {
            break;
        }
        total = total
            .checked_add(cell.output.value)
            .ok_or_else(|| eyre!("escrow value overflow"))?;
        selected.push(cell.clone());
    }
    if total < required {
        return Err(eyre!(
            "escrow holds {total} but unlock requires {required}"
        ));
    }
    Ok((selected, total))
}
