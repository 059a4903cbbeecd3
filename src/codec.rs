//! Event codec for bridge payloads embedded in chain transactions.
//!
//! Burn and mint events travel inside the `input_type` field of the first
//! witness of a shadow-chain transaction. The payload starts with a one-byte
//! discriminant followed by the event body; decoding dispatches on that byte.
//! Unlock transactions on the source chain embed the covered burn record ids
//! in a data output. All encode/decode here is pure and allocation-only.

use thiserror::Error;

/// Discriminant byte for a burn payload.
pub const BURN_DISCRIMINANT: u8 = 0x01;
/// Discriminant byte for a mint payload.
pub const MINT_DISCRIMINANT: u8 = 0x02;

/// Maximum bytes an unlock data output may carry on the source chain.
pub const UNLOCK_DATA_CAPACITY: usize = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,
    #[error("unknown event discriminant 0x{0:02x}")]
    UnknownDiscriminant(u8),
    #[error("payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("length field {0} exceeds payload")]
    LengthOverflow(u128),
    #[error("recipient is not valid utf-8")]
    InvalidUtf8,
    #[error("trailing bytes after event body")]
    TrailingBytes,
}

/// A structured bridge event recovered from a witness payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Shadow tokens destroyed; `recipient` is the source-chain address the
    /// escrowed asset should be released to.
    Burn(BurnEvent),
    /// Shadow tokens created against confirmed deposits; `lock_ids` are the
    /// source-chain deposit tx hashes the mint covers.
    Mint(MintEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnEvent {
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintEvent {
    pub lock_ids: Vec<[u8; 32]>,
}

/// Decode an event payload, dispatching on the discriminant byte.
pub fn decode_event(payload: &[u8]) -> Result<BridgeEvent, CodecError> {
    let (&discriminant, body) = payload.split_first().ok_or(CodecError::Empty)?;
    match discriminant {
        BURN_DISCRIMINANT => decode_burn(body).map(BridgeEvent::Burn),
        MINT_DISCRIMINANT => decode_mint(body).map(BridgeEvent::Mint),
        other => Err(CodecError::UnknownDiscriminant(other)),
    }
}

/// Encode a burn payload: discriminant, u128 LE recipient length, utf-8
/// recipient bytes.
pub fn encode_burn(event: &BurnEvent) -> Vec<u8> {
    let recipient = event.recipient.as_bytes();
    let mut out = Vec::with_capacity(1 + 16 + recipient.len());
    out.push(BURN_DISCRIMINANT);
    out.extend_from_slice(&(recipient.len() as u128).to_le_bytes());
    out.extend_from_slice(recipient);
    out
}

fn decode_burn(body: &[u8]) -> Result<BurnEvent, CodecError> {
    let (len, rest) = read_u128_le(body)?;
    let len_usize =
        usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
    if rest.len() < len_usize {
        return Err(CodecError::LengthOverflow(len));
    }
    let (recipient, trailing) = rest.split_at(len_usize);
    if !trailing.is_empty() {
        return Err(CodecError::TrailingBytes);
    }
    let recipient =
        String::from_utf8(recipient.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    Ok(BurnEvent { recipient })
}

/// Encode a mint payload: discriminant, u128 LE entry count, then the
/// 32-byte lock ids in order.
pub fn encode_mint(event: &MintEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 16 + 32 * event.lock_ids.len());
    out.push(MINT_DISCRIMINANT);
    out.extend_from_slice(&(event.lock_ids.len() as u128).to_le_bytes());
    for id in &event.lock_ids {
        out.extend_from_slice(id);
    }
    out
}

fn decode_mint(body: &[u8]) -> Result<MintEvent, CodecError> {
    let (count, mut rest) = read_u128_le(body)?;
    let count_usize =
        usize::try_from(count).map_err(|_| CodecError::LengthOverflow(count))?;
    let need = count_usize
        .checked_mul(32)
        .ok_or(CodecError::LengthOverflow(count))?;
    if rest.len() < need {
        return Err(CodecError::Truncated {
            need,
            have: rest.len(),
        });
    }
    let mut lock_ids = Vec::with_capacity(count_usize);
    for _ in 0..count_usize {
        let (id, tail) = rest.split_at(32);
        let mut buf = [0u8; 32];
        buf.copy_from_slice(id);
        lock_ids.push(buf);
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(MintEvent { lock_ids })
}

/// Read a shadow-token amount from cell data: a u128 LE at offset 0.
pub fn read_amount(cell_data: &[u8]) -> Result<u128, CodecError> {
    let (amount, _) = read_u128_le(cell_data)?;
    Ok(amount)
}

/// Encode the record hashes an unlock transaction covers into its data
/// output. At most two 32-byte hashes fit within the chain's data limit.
pub fn encode_unlock_ids(ids: &[[u8; 32]]) -> Result<Vec<u8>, CodecError> {
    let need = ids.len() * 32;
    if need > UNLOCK_DATA_CAPACITY {
        return Err(CodecError::LengthOverflow(ids.len() as u128));
    }
    let mut out = Vec::with_capacity(need);
    for id in ids {
        out.extend_from_slice(id);
    }
    Ok(out)
}

/// Split an unlock data output back into 32-byte record hashes. Data whose
/// length is not a multiple of 32 is not ours.
pub fn decode_unlock_ids(data: &[u8]) -> Result<Vec<[u8; 32]>, CodecError> {
    if data.is_empty() || data.len() % 32 != 0 {
        return Err(CodecError::Truncated {
            need: data.len().next_multiple_of(32).max(32),
            have: data.len(),
        });
    }
    Ok(data
        .chunks_exact(32)
        .map(|chunk| {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(chunk);
            buf
        })
        .collect())
}

/// The two payload slots of a witness: signatures in `lock`, bridge events
/// in `input_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WitnessEnvelope {
    pub lock: Option<Vec<u8>>,
    pub input_type: Option<Vec<u8>>,
}

impl WitnessEnvelope {
    /// Serialize: presence flags, then each present field as u32 LE length
    /// plus bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.lock.is_some() {
            flags |= 0x01;
        }
        if self.input_type.is_some() {
            flags |= 0x02;
        }
        let mut out = vec![flags];
        for field in [&self.lock, &self.input_type].into_iter().flatten() {
            out.extend_from_slice(&(field.len() as u32).to_le_bytes());
            out.extend_from_slice(field);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (&flags, mut rest) = data.split_first().ok_or(CodecError::Empty)?;
        let mut read_field = |present: bool| -> Result<Option<Vec<u8>>, CodecError> {
            if !present {
                return Ok(None);
            }
            if rest.len() < 4 {
                return Err(CodecError::Truncated {
                    need: 4,
                    have: rest.len(),
                });
            }
            let (head, tail) = rest.split_at(4);
            let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
            if tail.len() < len {
                return Err(CodecError::LengthOverflow(len as u128));
            }
            let (field, tail) = tail.split_at(len);
            rest = tail;
            Ok(Some(field.to_vec()))
        };

        let lock = read_field(flags & 0x01 != 0)?;
        let input_type = read_field(flags & 0x02 != 0)?;
        if !rest.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self { lock, input_type })
    }
}

fn read_u128_le(data: &[u8]) -> Result<(u128, &[u8]), CodecError> {
    if data.len() < 16 {
        return Err(CodecError::Truncated {
            need: 16,
            have: data.len(),
        });
    }
    let (head, rest) = data.split_at(16);
    let mut buf = [0u8; 16];
    buf.copy_from_slice(head);
    Ok((u128::from_le_bytes(buf), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burn_round_trip() {
        let event = BurnEvent {
            recipient: "src1qtestdepositaddr0000000".to_string(),
        };
        let encoded = encode_burn(&event);
        assert_eq!(encoded[0], BURN_DISCRIMINANT);
        match decode_event(&encoded).unwrap() {
            BridgeEvent::Burn(back) => assert_eq!(back, event),
            other => panic!("expected burn, got {other:?}"),
        }
    }

    #[test]
    fn test_mint_round_trip() {
        let event = MintEvent {
            lock_ids: vec![[0xaa; 32], [0xbb; 32]],
        };
        let encoded = encode_mint(&event);
        assert_eq!(encoded[0], MINT_DISCRIMINANT);
        match decode_event(&encoded).unwrap() {
            BridgeEvent::Mint(back) => assert_eq!(back, event),
            other => panic!("expected mint, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_discriminant_rejected() {
        assert_eq!(
            decode_event(&[0x7f, 0, 0]),
            Err(CodecError::UnknownDiscriminant(0x7f))
        );
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert_eq!(decode_event(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn test_truncated_burn_rejected() {
        let mut encoded = encode_burn(&BurnEvent {
            recipient: "src1recipient".to_string(),
        });
        encoded.truncate(encoded.len() - 3);
        assert!(decode_event(&encoded).is_err());
    }

    #[test]
    fn test_burn_length_overflow_rejected() {
        // claims a 1000-byte recipient but carries 4 bytes
        let mut payload = vec![BURN_DISCRIMINANT];
        payload.extend_from_slice(&1000u128.to_le_bytes());
        payload.extend_from_slice(b"abcd");
        assert_eq!(
            decode_event(&payload),
            Err(CodecError::LengthOverflow(1000))
        );
    }

    #[test]
    fn test_burn_trailing_bytes_rejected() {
        let mut encoded = encode_burn(&BurnEvent {
            recipient: "src1recipient".to_string(),
        });
        encoded.push(0x00);
        assert_eq!(decode_event(&encoded), Err(CodecError::TrailingBytes));
    }

    #[test]
    fn test_burn_invalid_utf8_rejected() {
        let mut payload = vec![BURN_DISCRIMINANT];
        payload.extend_from_slice(&2u128.to_le_bytes());
        payload.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(decode_event(&payload), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_mint_truncated_ids_rejected() {
        let mut payload = vec![MINT_DISCRIMINANT];
        payload.extend_from_slice(&2u128.to_le_bytes());
        payload.extend_from_slice(&[0xaa; 32]); // only one of two ids
        assert!(matches!(
            decode_event(&payload),
            Err(CodecError::Truncated { need: 64, have: 32 })
        ));
    }

    #[test]
    fn test_read_amount() {
        let mut data = 123_456_789u128.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 4]); // extra cell data ignored
        assert_eq!(read_amount(&data).unwrap(), 123_456_789);
        assert!(read_amount(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_witness_envelope_round_trip() {
        let envelope = WitnessEnvelope {
            lock: Some(vec![0x01, 0x02]),
            input_type: Some(encode_burn(&BurnEvent {
                recipient: "src1x".to_string(),
            })),
        };
        let back = WitnessEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(back, envelope);

        let lock_only = WitnessEnvelope {
            lock: Some(vec![0xff; 65]),
            input_type: None,
        };
        assert_eq!(
            WitnessEnvelope::decode(&lock_only.encode()).unwrap(),
            lock_only
        );
        assert_eq!(
            WitnessEnvelope::decode(&WitnessEnvelope::default().encode()).unwrap(),
            WitnessEnvelope::default()
        );
    }

    #[test]
    fn test_witness_envelope_truncated_rejected() {
        let mut encoded = WitnessEnvelope {
            lock: Some(vec![0x01; 10]),
            input_type: None,
        }
        .encode();
        encoded.truncate(encoded.len() - 4);
        assert!(WitnessEnvelope::decode(&encoded).is_err());
        assert_eq!(WitnessEnvelope::decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn test_unlock_ids_round_trip_and_cap() {
        let ids = [[0x11; 32], [0x22; 32]];
        let data = encode_unlock_ids(&ids).unwrap();
        assert_eq!(decode_unlock_ids(&data).unwrap(), ids.to_vec());

        // three hashes exceed the data output capacity
        assert!(encode_unlock_ids(&[[0u8; 32]; 3]).is_err());
        // misaligned data is rejected
        assert!(decode_unlock_ids(&[0u8; 33]).is_err());
    }
}
