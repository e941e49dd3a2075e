//! Event decoder (C2): pure functions turning base64-encoded `Program data:`
//! log lines into typed inbound/outbound records.
//!
//! All multi-byte fields in these payloads are Borsh/Anchor conventions —
//! little-endian. This is the opposite endianness of the TSS canonical
//! message in [`crate::tss`]; the two must never be consolidated.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

/// Prefix Solana programs use for `sol_log_data` output.
const PROGRAM_DATA_PREFIX: &str = "Program data: ";

/// Byte length of an Anchor event/instruction discriminator.
pub const DISCRIMINATOR_LEN: usize = 8;

/// Minimum length of an outbound observation payload (discriminator + two
/// 32-byte ids).
pub const MIN_OUTBOUND_LEN: usize = DISCRIMINATOR_LEN + 32 + 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload shorter than discriminator: {len} bytes")]
    MissingDiscriminator { len: usize },
    #[error("truncated payload: expected at least {expected} bytes for field '{field}', got {actual}")]
    Truncated {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("outbound payload too short: {len} bytes, need at least {MIN_OUTBOUND_LEN}")]
    OutboundTooShort { len: usize },
    #[error("failed to decode inner UniversalPayload: {0}")]
    UniversalPayload(#[source] Box<DecodeError>),
    #[error("not valid base64")]
    InvalidBase64,
}

/// How quickly a decoded event is expected to be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationType {
    Fast,
    Standard,
}

/// Routing entry for a single discriminator, supplied by deployment config.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    pub method_name: String,
    pub confirmation_type: ConfirmationType,
}

/// Discriminator (hex) -> descriptor routing table. Unknown discriminators
/// are silently skipped by [`decode_transaction_events`].
pub type DiscriminatorTable = HashMap<String, EventDescriptor>;

/// Chain-neutral invocation descriptor embedded inside inbound events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UniversalPayload {
    pub to: String,
    pub value: String,
    pub data: String,
    pub gas_limit: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub nonce: String,
    pub deadline: String,
    pub verification_type: u8,
}

/// Decoded inbound (`TxWithFunds`) event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniversalTx {
    /// Sender pubkey, emitted as `0x`-hex (NOT base58 — see
    /// [`crate::events`] module docs for the base58/hex asymmetry).
    pub sender: String,
    /// 20-byte EVM-style recipient, `0x`-hex.
    pub recipient: String,
    /// Bridge token pubkey, kept base58 by design — downstream consumers
    /// depend on this asymmetry with `sender`.
    pub token: String,
    /// Decimal string.
    pub amount: String,
    pub payload: Option<UniversalPayload>,
    pub revert_recipient: String,
    /// `0x`-hex, defaults to `"0x"` when absent/truncated.
    pub revert_message: String,
    pub tx_type: u8,
    /// `0x`-hex, defaults to `"0x"` when absent/truncated.
    pub verification_data: String,
}

/// Decoded outbound observation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundObservation {
    pub tx_id: [u8; 32],
    pub universal_tx_id: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Inbound(UniversalTx),
    Outbound(OutboundObservation),
}

impl DecodedEvent {
    /// FAST for `tx_type` 0 or 1, STANDARD otherwise. Only meaningful for
    /// inbound events; outbound observations use the descriptor's
    /// configured confirmation type unconditionally.
    #[must_use]
    pub fn default_confirmation_type(&self) -> ConfirmationType {
        match self {
            DecodedEvent::Inbound(tx) if matches!(tx.tx_type, 0 | 1) => ConfirmationType::Fast,
            DecodedEvent::Inbound(_) => ConfirmationType::Standard,
            DecodedEvent::Outbound(_) => ConfirmationType::Standard,
        }
    }
}

/// Minimal byte cursor used to decode the fixed-then-variable Borsh layouts
/// described by the wire format.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                field,
                expected: len,
                actual: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u32_le(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(field, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    fn take_u64_le(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let bytes = self.take(field, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    fn take_i64_le(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        let bytes = self.take(field, 8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("length checked")))
    }
}

fn to_hex_0x(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decodes the inner Borsh-encoded `UniversalPayload`:
/// `to[20] | value u64 | data Vec<u8> | gas_limit u64 | max_fee_per_gas u64
/// | max_priority_fee_per_gas u64 | nonce u64 | deadline i64 | v_type u8`.
fn decode_universal_payload(bytes: &[u8]) -> Result<UniversalPayload, DecodeError> {
    let mut cursor = Cursor::new(bytes);
    let to = to_hex_0x(cursor.take("payload.to", 20)?);
    let value = cursor.take_u64_le("payload.value")?;
    let data_len = cursor.take_u32_le("payload.data_len")? as usize;
    let data = to_hex_0x(cursor.take("payload.data", data_len)?);
    let gas_limit = cursor.take_u64_le("payload.gas_limit")?;
    let max_fee_per_gas = cursor.take_u64_le("payload.max_fee_per_gas")?;
    let max_priority_fee_per_gas = cursor.take_u64_le("payload.max_priority_fee_per_gas")?;
    let nonce = cursor.take_u64_le("payload.nonce")?;
    let deadline = cursor.take_i64_le("payload.deadline")?;
    let verification_type = *cursor
        .take("payload.v_type", 1)?
        .first()
        .expect("length checked");

    Ok(UniversalPayload {
        to,
        value: value.to_string(),
        data,
        gas_limit: gas_limit.to_string(),
        max_fee_per_gas: max_fee_per_gas.to_string(),
        max_priority_fee_per_gas: max_priority_fee_per_gas.to_string(),
        nonce: nonce.to_string(),
        deadline: deadline.to_string(),
        verification_type,
    })
}

/// Decodes a `TxWithFunds` inbound event payload, not including its leading
/// 8-byte discriminator (the caller strips that via [`split_discriminator`]).
///
/// Fields up through the inner `UniversalPayload` are mandatory: truncation
/// there is an error. Fields after it (revert recipient/message, tx_type,
/// verification_data) are a trailing optional tail — truncation there
/// yields a partially-populated record with documented defaults instead of
/// an error, matching observed on-chain behavior where older transactions
/// may predate a field being added.
pub fn decode_inbound(payload: &[u8]) -> Result<UniversalTx, DecodeError> {
    let mut cursor = Cursor::new(payload);

    let sender = to_hex_0x(cursor.take("sender", 32)?);
    let recipient = to_hex_0x(cursor.take("recipient", 20)?);
    let token = bs58::encode(cursor.take("bridge_token", 32)?).into_string();
    let amount = cursor.take_u64_le("bridge_amount")?.to_string();
    let data_len = cursor.take_u32_le("data_len")? as usize;
    let payload_bytes = cursor.take("inner_payload", data_len)?;
    let payload = if payload_bytes.is_empty() {
        None
    } else {
        Some(
            decode_universal_payload(payload_bytes)
                .map_err(|error| DecodeError::UniversalPayload(Box::new(error)))?,
        )
    };

    let mut tx = UniversalTx {
        sender,
        recipient,
        token,
        amount,
        payload,
        revert_recipient: String::new(),
        revert_message: "0x".to_string(),
        tx_type: 0,
        verification_data: "0x".to_string(),
    };

    // Trailing optional tail: revert.recipient | revert_msg | tx_type | verification_data.
    // Truncation from here on returns what has been populated so far.
    let Ok(revert_recipient) = cursor.take("revert.recipient", 32) else {
        return Ok(tx);
    };
    tx.revert_recipient = bs58::encode(revert_recipient).into_string();

    let Ok(revert_msg_len) = cursor.take_u32_le("revert_msg_len") else {
        return Ok(tx);
    };
    let Ok(revert_msg) = cursor.take("revert_msg", revert_msg_len as usize) else {
        return Ok(tx);
    };
    tx.revert_message = to_hex_0x(revert_msg);

    let Ok(tx_type_byte) = cursor.take("tx_type", 1) else {
        return Ok(tx);
    };
    tx.tx_type = tx_type_byte[0];

    let Ok(sig_len) = cursor.take_u32_le("sig_len") else {
        return Ok(tx);
    };
    let Ok(verification_data) = cursor.take("verification_data", sig_len as usize) else {
        return Ok(tx);
    };
    tx.verification_data = to_hex_0x(verification_data);

    Ok(tx)
}

/// Decodes an `OutboundObservation` event payload (post-discriminator):
/// `tx_id[32] | universal_tx_id[32]`.
pub fn decode_outbound(payload: &[u8]) -> Result<OutboundObservation, DecodeError> {
    if payload.len() + DISCRIMINATOR_LEN < MIN_OUTBOUND_LEN {
        return Err(DecodeError::OutboundTooShort {
            len: payload.len() + DISCRIMINATOR_LEN,
        });
    }
    let mut cursor = Cursor::new(payload);
    let tx_id = cursor.take("tx_id", 32)?.try_into().expect("length checked");
    let universal_tx_id = cursor
        .take("universal_tx_id", 32)?
        .try_into()
        .expect("length checked");
    Ok(OutboundObservation {
        tx_id,
        universal_tx_id,
    })
}

/// Strips and hex-encodes the leading 8-byte discriminator.
fn split_discriminator(raw: &[u8]) -> Result<(String, &[u8]), DecodeError> {
    if raw.len() < DISCRIMINATOR_LEN {
        return Err(DecodeError::MissingDiscriminator { len: raw.len() });
    }
    let (disc, rest) = raw.split_at(DISCRIMINATOR_LEN);
    Ok((hex::encode(disc), rest))
}

/// Decodes a single `Program data: <base64>` log line into raw bytes, or
/// `None` if the line doesn't carry that prefix or isn't valid base64.
#[must_use]
pub fn decode_program_data_log(log: &str) -> Option<Vec<u8>> {
    let encoded = log.trim().strip_prefix(PROGRAM_DATA_PREFIX)?;
    BASE64.decode(encoded.trim()).ok()
}

/// Scans a transaction's log lines for the first event whose discriminator
/// matches `table`, decoding it according to the descriptor's method name.
///
/// A single transaction may emit multiple events; only the first match is
/// returned, per the per-transaction decode contract. Unknown
/// discriminators and undecodable log lines are silently skipped.
pub fn decode_transaction_events(
    logs: &[String],
    table: &DiscriminatorTable,
) -> Option<(EventDescriptor, DecodedEvent)> {
    for log in logs {
        let Some(raw) = decode_program_data_log(log) else {
            continue;
        };
        let Ok((discriminator, body)) = split_discriminator(&raw) else {
            continue;
        };
        let Some(descriptor) = table.get(&discriminator) else {
            continue;
        };

        let decoded = if is_outbound_method(&descriptor.method_name) {
            decode_outbound(body).ok().map(DecodedEvent::Outbound)
        } else {
            decode_inbound(body).ok().map(DecodedEvent::Inbound)
        };

        if let Some(event) = decoded {
            return Some((descriptor.clone(), event));
        }
    }
    None
}

fn is_outbound_method(method_name: &str) -> bool {
    method_name.eq_ignore_ascii_case("outbound_observation")
        || method_name.eq_ignore_ascii_case("outbound")
}

/// Whether a program invocation segment of a transaction's logs completed,
/// and the log indexes that fell inside it.
///
/// Not named anywhere in the wire-format spec; a transaction can contain a
/// CPI into the gateway program that later gets rolled back by a failure
/// further up the call stack, and an event emitted during that rolled-back
/// invocation must not be attributed as if it had taken effect.
#[derive(Debug, PartialEq, Eq)]
pub enum ProgramInvocationState {
    InProgress(Vec<usize>),
    Succeeded(Vec<usize>),
    Failed(Vec<usize>),
}

/// Log-line prefixes Solana emits around a program invocation, scoped to one
/// program id.
struct MatchContext {
    expected_start: String,
    expected_success: String,
    expected_failure: String,
}

impl MatchContext {
    fn new(program_id: &str) -> Self {
        Self {
            expected_start: format!("Program {program_id} invoke"),
            expected_success: format!("Program {program_id} success"),
            expected_failure: format!("Program {program_id} failed"),
        }
    }
}

/// Partitions `logs` into a stack of invocation segments for `program_id`,
/// tracking only which log indexes fall inside each segment and whether it
/// ultimately succeeded, failed, or (if logs end mid-invocation) is still
/// open.
///
/// Invocations of `program_id` can nest (a CPI back into itself), hence the
/// stack rather than a single running segment.
#[must_use]
pub fn build_program_event_stack(logs: &[String], program_id: &str) -> Vec<ProgramInvocationState> {
    let ctx = MatchContext::new(program_id);
    let mut stack: Vec<ProgramInvocationState> = Vec::new();

    for (idx, log) in logs.iter().enumerate() {
        if log.starts_with(ctx.expected_start.as_str()) {
            stack.push(ProgramInvocationState::InProgress(Vec::new()));
        } else if log.starts_with(ctx.expected_success.as_str()) {
            if let Some(ProgramInvocationState::InProgress(indexes)) = stack.pop() {
                stack.push(ProgramInvocationState::Succeeded(indexes));
            }
        } else if log.starts_with(ctx.expected_failure.as_str()) {
            if let Some(ProgramInvocationState::InProgress(indexes)) = stack.pop() {
                stack.push(ProgramInvocationState::Failed(indexes));
            }
        } else if let Some(ProgramInvocationState::InProgress(indexes)) = stack.last_mut() {
            indexes.push(idx);
        }
    }

    stack
}

/// Log indexes that fall within a successfully completed invocation of
/// `program_id`, across every (possibly nested) segment in `logs`.
fn succeeded_log_indexes(logs: &[String], program_id: &str) -> std::collections::HashSet<usize> {
    build_program_event_stack(logs, program_id)
        .into_iter()
        .filter_map(|state| match state {
            ProgramInvocationState::Succeeded(indexes) => Some(indexes),
            ProgramInvocationState::InProgress(_) | ProgramInvocationState::Failed(_) => None,
        })
        .flatten()
        .collect()
}

/// Same contract as [`decode_transaction_events`], but additionally
/// discards matches emitted by an invocation of `program_id` that failed
/// (and was therefore rolled back) within the same transaction.
pub fn decode_transaction_events_scoped(
    logs: &[String],
    table: &DiscriminatorTable,
    program_id: &str,
) -> Option<(EventDescriptor, DecodedEvent)> {
    let succeeded = succeeded_log_indexes(logs, program_id);

    for (idx, log) in logs.iter().enumerate() {
        if !succeeded.contains(&idx) {
            continue;
        }
        let Some(raw) = decode_program_data_log(log) else {
            continue;
        };
        let Ok((discriminator, body)) = split_discriminator(&raw) else {
            continue;
        };
        let Some(descriptor) = table.get(&discriminator) else {
            continue;
        };

        let decoded = if is_outbound_method(&descriptor.method_name) {
            decode_outbound(body).ok().map(DecodedEvent::Outbound)
        } else {
            decode_inbound(body).ok().map(DecodedEvent::Inbound)
        };

        if let Some(event) = decoded {
            return Some((descriptor.clone(), event));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inbound_bytes(with_tail: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0xAA; 32]); // sender
        buf.extend_from_slice(&[0xBB; 20]); // recipient
        buf.extend_from_slice(&[0xCC; 32]); // bridge_token
        buf.extend_from_slice(&1_000_000u64.to_le_bytes()); // amount
        buf.extend_from_slice(&0u32.to_le_bytes()); // empty inner payload
        if with_tail {
            buf.extend_from_slice(&[0xDD; 32]); // revert recipient
            let msg = b"reverted";
            buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
            buf.extend_from_slice(msg);
            buf.push(2); // tx_type
            let sig = b"sig-bytes";
            buf.extend_from_slice(&(sig.len() as u32).to_le_bytes());
            buf.extend_from_slice(sig);
        }
        buf
    }

    #[test]
    fn decodes_full_inbound_payload() {
        let tx = decode_inbound(&sample_inbound_bytes(true)).unwrap();
        assert_eq!(tx.sender, format!("0x{}", "aa".repeat(32)));
        assert_eq!(tx.recipient, format!("0x{}", "bb".repeat(20)));
        assert_eq!(tx.token, bs58::encode([0xCC; 32]).into_string());
        assert_eq!(tx.amount, "1000000");
        assert!(tx.payload.is_none());
        assert_eq!(tx.tx_type, 2);
        assert_eq!(tx.revert_message, format!("0x{}", hex::encode(b"reverted")));
        assert_eq!(
            tx.verification_data,
            format!("0x{}", hex::encode(b"sig-bytes"))
        );
    }

    #[test]
    fn truncated_trailing_tail_uses_defaults() {
        let tx = decode_inbound(&sample_inbound_bytes(false)).unwrap();
        assert_eq!(tx.revert_message, "0x");
        assert_eq!(tx.verification_data, "0x");
        assert_eq!(tx.tx_type, 0);
    }

    #[test]
    fn truncation_before_mandatory_field_is_an_error() {
        let bytes = &sample_inbound_bytes(true)[..10];
        assert!(matches!(
            decode_inbound(bytes),
            Err(DecodeError::Truncated { field: "recipient", .. })
        ));
    }

    #[test]
    fn universal_payload_round_trips_field_level() {
        let mut inner = Vec::new();
        inner.extend_from_slice(&[0x11; 20]);
        inner.extend_from_slice(&500u64.to_le_bytes());
        let data = b"hello";
        inner.extend_from_slice(&(data.len() as u32).to_le_bytes());
        inner.extend_from_slice(data);
        inner.extend_from_slice(&21_000u64.to_le_bytes());
        inner.extend_from_slice(&100u64.to_le_bytes());
        inner.extend_from_slice(&2u64.to_le_bytes());
        inner.extend_from_slice(&7u64.to_le_bytes());
        inner.extend_from_slice(&9_999i64.to_le_bytes());
        inner.push(1);

        let payload = decode_universal_payload(&inner).unwrap();
        assert_eq!(payload.to, format!("0x{}", "11".repeat(20)));
        assert_eq!(payload.value, "500");
        assert_eq!(payload.data, format!("0x{}", hex::encode(data)));
        assert_eq!(payload.gas_limit, "21000");
        assert_eq!(payload.nonce, "7");
        assert_eq!(payload.deadline, "9999");
        assert_eq!(payload.verification_type, 1);
    }

    #[test]
    fn outbound_payload_too_short_is_rejected() {
        let body = [0u8; 10];
        assert!(matches!(
            decode_outbound(&body),
            Err(DecodeError::OutboundTooShort { .. })
        ));
    }

    #[test]
    fn outbound_payload_decodes_ids() {
        let mut body = Vec::new();
        body.extend_from_slice(&[1u8; 32]);
        body.extend_from_slice(&[2u8; 32]);
        let observation = decode_outbound(&body).unwrap();
        assert_eq!(observation.tx_id, [1u8; 32]);
        assert_eq!(observation.universal_tx_id, [2u8; 32]);
    }

    #[test]
    fn decodes_program_data_log_line() {
        let raw = b"hello world".to_vec();
        let encoded = BASE64.encode(&raw);
        let log = format!("Program data: {encoded}");
        assert_eq!(decode_program_data_log(&log), Some(raw));
        assert_eq!(decode_program_data_log("Program log: unrelated"), None);
    }

    #[test]
    fn unknown_discriminator_is_skipped() {
        let table = DiscriminatorTable::new();
        let raw = [0xAA; 8 + 32 + 32];
        let encoded = BASE64.encode(raw);
        let logs = vec![format!("Program data: {encoded}")];
        assert_eq!(decode_transaction_events(&logs, &table), None);
    }

    fn outbound_data_log(discriminator: [u8; 8]) -> String {
        let mut raw = discriminator.to_vec();
        raw.extend_from_slice(&[1u8; 32]);
        raw.extend_from_slice(&[2u8; 32]);
        format!("Program data: {}", BASE64.encode(raw))
    }

    #[test]
    fn event_stack_marks_invocation_outcomes() {
        let program = "Prog1111111111111111111111111111111111111";
        let logs = vec![
            format!("Program {program} invoke [1]"),
            "Program data: irrelevant".to_string(),
            format!("Program {program} success"),
            format!("Program {program} invoke [1]"),
            "Program data: also irrelevant".to_string(),
            format!("Program {program} failed"),
        ]
        .into_iter()
        .collect::<Vec<_>>();

        let stack = build_program_event_stack(&logs, program);
        assert_eq!(stack.len(), 2);
        assert!(matches!(stack[0], ProgramInvocationState::Succeeded(ref idx) if idx == &[1]));
        assert!(matches!(stack[1], ProgramInvocationState::Failed(ref idx) if idx == &[4]));
    }

    #[test]
    fn scoped_decode_ignores_events_from_failed_invocation() {
        let program = "Prog1111111111111111111111111111111111111";
        let mut table = DiscriminatorTable::new();
        table.insert(
            "aaaaaaaaaaaaaaaa".to_string(),
            EventDescriptor {
                method_name: "outbound_observation".to_string(),
                confirmation_type: ConfirmationType::Standard,
            },
        );

        let logs = vec![
            format!("Program {program} invoke [1]"),
            outbound_data_log([0xAA; 8]),
            format!("Program {program} failed"),
        ];
        assert_eq!(decode_transaction_events_scoped(&logs, &table, program), None);

        let logs = vec![
            format!("Program {program} invoke [1]"),
            outbound_data_log([0xAA; 8]),
            format!("Program {program} success"),
        ];
        let (descriptor, event) =
            decode_transaction_events_scoped(&logs, &table, program).expect("decodes from succeeded invocation");
        assert_eq!(descriptor.method_name, "outbound_observation");
        assert!(matches!(event, DecodedEvent::Outbound(_)));
    }

    #[test]
    fn scoped_decode_ignores_logs_outside_any_invocation() {
        let program = "Prog1111111111111111111111111111111111111";
        let mut table = DiscriminatorTable::new();
        table.insert(
            "aaaaaaaaaaaaaaaa".to_string(),
            EventDescriptor {
                method_name: "outbound_observation".to_string(),
                confirmation_type: ConfirmationType::Standard,
            },
        );
        let logs = vec![outbound_data_log([0xAA; 8])];
        assert_eq!(decode_transaction_events_scoped(&logs, &table, program), None);
    }
}
