//! TSS Message Builder (C7): the canonical byte message signed by the
//! threshold signature service for every outbound instruction, its
//! Keccak-256 digest, and recovery-ID determination against a known EVM
//! address.
//!
//! All multi-byte fields here are **big-endian** — the opposite convention
//! from the Borsh/Anchor fields in [`crate::events`] and [`crate::outbound`].
//! The discriminator-algorithm split matters too: Anchor discriminators use
//! SHA-256, this module's digest uses Keccak-256. Never consolidate either
//! split; §9 of the spec calls both out explicitly.

use libsecp256k1::{Message, PublicKey, RecoveryId, Signature};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Prefix prepended to every canonical TSS message, ahead of the
/// instruction id byte.
pub const MESSAGE_PREFIX: &[u8] = b"PUSH_CHAIN_SVM";

#[derive(Debug, Error)]
pub enum TssError {
    #[error("unknown outbound instruction id: {0}")]
    UnknownInstructionId(u8),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("malformed expected address '{0}'")]
    MalformedAddress(String),
    #[error("recovery id did not match any candidate against the expected address")]
    RecoveryFailed,
}

/// A single remaining account passed through to an outbound `execute`
/// instruction, carried in both the TSS message and the Anchor instruction
/// data's writable-flags bitmap.
#[derive(Debug, Clone, Copy)]
pub struct GatewayAccountMeta {
    pub pubkey: [u8; 32],
    pub writable: bool,
}

/// Ephemeral outbound signing request (spec §3 "Outbound Signing Request").
#[derive(Debug, Clone)]
pub struct OutboundSigningRequest {
    pub instruction_id: u8,
    /// Chain id as stored in the on-chain TSS PDA, read dynamically.
    pub chain_id: String,
    pub nonce: u64,
    pub amount: u64,
    pub tx_id: [u8; 32],
    pub universal_tx_id: [u8; 32],
    pub sender: [u8; 20],
    /// Zero for the native asset.
    pub token: [u8; 32],
    pub gas_fee: u64,
    pub target_program: [u8; 32],
    pub accounts: Vec<GatewayAccountMeta>,
    pub ix_data: Vec<u8>,
    pub rent_fee: u64,
    pub revert_recipient: [u8; 32],
    pub revert_mint: [u8; 32],
}

/// `instruction_id` constants from spec §4.8 step 3 / §4.7's variant table.
pub mod instruction_id {
    pub const WITHDRAW: u8 = 1;
    pub const EXECUTE: u8 = 2;
    pub const REVERT_NATIVE: u8 = 3;
    pub const REVERT_SPL: u8 = 4;
}

fn push_be(buf: &mut Vec<u8>, tail: &[u8]) {
    buf.extend_from_slice(tail);
}

/// Builds the canonical message and returns its Keccak-256 digest.
///
/// `"PUSH_CHAIN_SVM" || instruction_id(u8) || chain_id(utf8, no length
/// prefix) || nonce(u64 BE) || amount(u64 BE) || <variant tail>` — see spec
/// §4.7 for the per-variant tail layout.
pub fn build_message(request: &OutboundSigningRequest) -> Result<Vec<u8>, TssError> {
    let mut message = Vec::new();
    message.extend_from_slice(MESSAGE_PREFIX);
    message.push(request.instruction_id);
    message.extend_from_slice(request.chain_id.as_bytes());
    push_be(&mut message, &request.nonce.to_be_bytes());
    push_be(&mut message, &request.amount.to_be_bytes());

    match request.instruction_id {
        instruction_id::WITHDRAW => {
            push_be(&mut message, &request.tx_id);
            push_be(&mut message, &request.universal_tx_id);
            push_be(&mut message, &request.sender);
            push_be(&mut message, &request.token);
            push_be(&mut message, &request.gas_fee.to_be_bytes());
            push_be(&mut message, &request.target_program);
        }
        instruction_id::EXECUTE => {
            push_be(&mut message, &request.tx_id);
            push_be(&mut message, &request.universal_tx_id);
            push_be(&mut message, &request.sender);
            push_be(&mut message, &request.token);
            push_be(&mut message, &request.gas_fee.to_be_bytes());
            push_be(&mut message, &request.target_program);
            push_be(
                &mut message,
                &(request.accounts.len() as u32).to_be_bytes(),
            );
            for account in &request.accounts {
                push_be(&mut message, &account.pubkey);
                message.push(u8::from(account.writable));
            }
            push_be(&mut message, &(request.ix_data.len() as u32).to_be_bytes());
            push_be(&mut message, &request.ix_data);
            push_be(&mut message, &request.rent_fee.to_be_bytes());
        }
        instruction_id::REVERT_NATIVE => {
            push_be(&mut message, &request.universal_tx_id);
            push_be(&mut message, &request.tx_id);
            push_be(&mut message, &request.revert_recipient);
            push_be(&mut message, &request.gas_fee.to_be_bytes());
        }
        instruction_id::REVERT_SPL => {
            push_be(&mut message, &request.universal_tx_id);
            push_be(&mut message, &request.tx_id);
            push_be(&mut message, &request.revert_mint);
            push_be(&mut message, &request.revert_recipient);
            push_be(&mut message, &request.gas_fee.to_be_bytes());
        }
        other => return Err(TssError::UnknownInstructionId(other)),
    }

    Ok(message)
}

/// Convenience wrapper: builds the canonical message and hashes it.
pub fn digest(request: &OutboundSigningRequest) -> Result<[u8; 32], TssError> {
    let message = build_message(request)?;
    Ok(Keccak256::digest(&message).into())
}

/// Derives the 20-byte EVM-style address of an uncompressed secp256k1
/// public key: `Keccak256(pubkey_without_0x04_prefix)[12:]`.
fn address_from_pubkey(pubkey: &PublicKey) -> [u8; 20] {
    let uncompressed = pubkey.serialize(); // 65 bytes, leading 0x04
    let hash = Keccak256::digest(&uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

fn parse_expected_address(expected: &str) -> Result<[u8; 20], TssError> {
    let trimmed = expected.strip_prefix("0x").unwrap_or(expected);
    let bytes = hex::decode(trimmed)
        .map_err(|_| TssError::MalformedAddress(expected.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| TssError::MalformedAddress(expected.to_string()))
}

/// Determines the recovery id (`v ∈ {0, 1}`) of a 64-byte `(r || s)`
/// secp256k1 signature over `digest` that recovers to `expected_address`.
///
/// Tries both candidate values and returns the one whose recovered address
/// matches; fails with [`TssError::RecoveryFailed`] if neither does.
pub fn determine_recovery_id(
    digest: &[u8; 32],
    signature: &[u8; 64],
    expected_address: &str,
) -> Result<u8, TssError> {
    let expected = parse_expected_address(expected_address)?;
    let message = Message::parse(digest);
    let signature =
        Signature::parse_standard(signature).map_err(|_| TssError::MalformedSignature)?;

    for candidate in [0u8, 1u8] {
        let Ok(recovery_id) = RecoveryId::parse(candidate) else {
            continue;
        };
        if let Ok(recovered) = libsecp256k1::recover(&message, &signature, &recovery_id) {
            if address_from_pubkey(&recovered) == expected {
                return Ok(candidate);
            }
        }
    }

    Err(TssError::RecoveryFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(instruction_id: u8) -> OutboundSigningRequest {
        OutboundSigningRequest {
            instruction_id,
            chain_id: "devnet".to_string(),
            nonce: 42,
            amount: 1_000_000,
            tx_id: [1u8; 32],
            universal_tx_id: [2u8; 32],
            sender: [3u8; 20],
            token: [0u8; 32],
            gas_fee: 500,
            target_program: [4u8; 32],
            accounts: vec![
                GatewayAccountMeta {
                    pubkey: [5u8; 32],
                    writable: true,
                },
                GatewayAccountMeta {
                    pubkey: [6u8; 32],
                    writable: false,
                },
            ],
            ix_data: b"hello".to_vec(),
            rent_fee: 10,
            revert_recipient: [7u8; 32],
            revert_mint: [8u8; 32],
        }
    }

    #[test]
    fn messages_diverge_by_instruction_id_byte() {
        let withdraw = build_message(&base_request(instruction_id::WITHDRAW)).unwrap();
        let execute = build_message(&base_request(instruction_id::EXECUTE)).unwrap();
        // Byte 14 is right after the 14-byte "PUSH_CHAIN_SVM" prefix.
        assert_eq!(MESSAGE_PREFIX.len(), 14);
        assert_ne!(withdraw[14], execute[14]);
        assert_eq!(withdraw[14], instruction_id::WITHDRAW);
        assert_eq!(execute[14], instruction_id::EXECUTE);
    }

    #[test]
    fn unknown_instruction_id_is_an_error() {
        let request = base_request(9);
        assert!(matches!(
            build_message(&request),
            Err(TssError::UnknownInstructionId(9))
        ));
    }

    #[test]
    fn execute_tail_encodes_accounts_big_endian_count_first() {
        let request = base_request(instruction_id::EXECUTE);
        let message = build_message(&request).unwrap();
        // prefix(14) + id(1) + chain_id(6) + nonce(8) + amount(8) = 37
        // tail: tx_id(32) utx_id(32) sender(20) token(32) gas_fee(8) target(32) = 156
        let accounts_count_offset = 37 + 156;
        let count = u32::from_be_bytes(
            message[accounts_count_offset..accounts_count_offset + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn recovery_id_round_trips_with_real_signature() {
        let secret = libsecp256k1::SecretKey::parse(&[0x11; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secret);
        let address = address_from_pubkey(&public);
        let address_hex = format!("0x{}", hex::encode(address));

        let digest = [0x42u8; 32];
        let message = Message::parse(&digest);
        let (signature, recovery_id) = libsecp256k1::sign(&message, &secret);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&signature.serialize());

        let found = determine_recovery_id(&digest, &raw, &address_hex).unwrap();
        assert_eq!(found, recovery_id.serialize());
    }

    #[test]
    fn recovery_fails_against_wrong_address() {
        let secret = libsecp256k1::SecretKey::parse(&[0x22; 32]).unwrap();
        let digest = [0x99u8; 32];
        let message = Message::parse(&digest);
        let (signature, _recovery_id) = libsecp256k1::sign(&message, &secret);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&signature.serialize());

        let wrong_address = "0x000000000000000000000000000000000000dead";
        assert!(matches!(
            determine_recovery_id(&digest, &raw, wrong_address),
            Err(TssError::RecoveryFailed)
        ));
    }
}
