//! Outbound Transaction Builder (C8): fetches the TSS PDA's nonce, derives
//! every PDA the on-chain instruction needs, builds the Anchor instruction
//! data, prepends a compute-budget instruction, and assembles the final
//! transaction for the relayer to sign and send.
//!
//! PDA derivation style grounded in `programs/axelar-solana-gateway/src/lib.rs`'s
//! `seed_prefixes` module and `Pubkey::find_program_address` usage;
//! compute-budget injection grounded in `solana/src/utils.rs`'s
//! `create_compute_budget_instructions`.

use sha2::{Digest, Sha256};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use thiserror::Error;

use crate::tss::{self, GatewayAccountMeta, OutboundSigningRequest, TssError};

/// Seed for the TSS PDA — literally `"tsspda"`; earlier variants used
/// `"tss"` and are incorrect (spec §4.8 step 1).
pub const TSS_PDA_SEED: &[u8] = b"tsspda";
/// Seed for the gateway config PDA. Not named by the spec; invented here
/// and recorded as an open question in the design notes.
pub const CONFIG_PDA_SEED: &[u8] = b"config";
/// Seed for the native-SOL vault PDA.
pub const VAULT_PDA_SEED: &[u8] = b"vault";
/// Seed for the cross-chain execution authority PDA.
pub const CEA_AUTHORITY_PDA_SEED: &[u8] = b"cea-authority";
/// Seed prefix for the per-transaction executed-tx replay guard PDA; the
/// 32-byte tx_id is appended as a second seed.
pub const EXECUTED_TX_PDA_SEED: &[u8] = b"executed-tx";

/// Default compute unit limit when the caller doesn't supply one, or
/// supplies zero / something unparseable.
pub const DEFAULT_COMPUTE_UNIT_LIMIT: u32 = 200_000;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("tss pda account data too short")]
    TssPdaTooShort,
    #[error("tss pda account data is not valid utf-8 in the chain_id field")]
    TssPdaInvalidChainId,
    #[error("unsupported tx_type/native combination for outbound instruction selection")]
    UnsupportedTxType,
    #[error(transparent)]
    Tss(#[from] TssError),
}

/// Classifies an inbound observation's `tx_type` (plus native-asset-ness for
/// reverts) into the instruction id C7/C8 build a message for.
///
/// The spec names these tx_type categories (`FUNDS`, `FUNDS_AND_PAYLOAD`,
/// `GAS_AND_PAYLOAD`, `INBOUND_REVERT`) without fixing their numeric
/// encoding; this mirrors the FAST/STANDARD split in
/// [`crate::events::DecodedEvent::default_confirmation_type`] (0/1 are the
/// cheap, fast-confirmed paths) — `Funds` and `FundsAndPayload` take 0/1,
/// `GasAndPayload` and `InboundRevert` take 2/3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Funds,
    FundsAndPayload,
    GasAndPayload,
    InboundRevert,
}

impl TxType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxType::Funds),
            1 => Some(TxType::FundsAndPayload),
            2 => Some(TxType::GasAndPayload),
            3 => Some(TxType::InboundRevert),
            _ => None,
        }
    }
}

/// Picks the outbound instruction id per spec §4.8 step 3.
pub fn instruction_id_for(tx_type: TxType, is_native: bool) -> Result<u8, OutboundError> {
    match tx_type {
        TxType::Funds => Ok(tss::instruction_id::WITHDRAW),
        TxType::FundsAndPayload | TxType::GasAndPayload => Ok(tss::instruction_id::EXECUTE),
        TxType::InboundRevert if is_native => Ok(tss::instruction_id::REVERT_NATIVE),
        TxType::InboundRevert => Ok(tss::instruction_id::REVERT_SPL),
    }
}

#[must_use]
pub fn derive_tss_pda(gateway_program: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[TSS_PDA_SEED], gateway_program)
}

#[must_use]
pub fn derive_config_pda(gateway_program: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CONFIG_PDA_SEED], gateway_program)
}

#[must_use]
pub fn derive_vault_pda(gateway_program: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[VAULT_PDA_SEED], gateway_program)
}

#[must_use]
pub fn derive_cea_authority_pda(gateway_program: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CEA_AUTHORITY_PDA_SEED], gateway_program)
}

#[must_use]
pub fn derive_executed_tx_pda(gateway_program: &Pubkey, tx_id: &[u8; 32]) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[EXECUTED_TX_PDA_SEED, tx_id], gateway_program)
}

/// Parsed view of the on-chain TSS PDA account (spec §4.8 step 2 layout).
#[derive(Debug, Clone)]
pub struct TssPdaAccount {
    pub tss_eth_address: [u8; 20],
    pub chain_id: String,
    pub nonce: u64,
    /// Present when the account carries the trailing authority/bump bytes;
    /// absent data here is not itself a parse failure.
    pub authority: Option<[u8; 32]>,
    pub bump: Option<u8>,
}

/// Parses a TSS PDA account's raw data.
///
/// Layout: `[8] discriminator | [20] tss_eth_address | [4] chain_id_len (LE)
/// | [chain_id_len] chain_id utf-8 | [8] nonce (LE) | [32] authority | [1] bump`.
/// Rejects with [`OutboundError::TssPdaTooShort`] if shorter than
/// `32 + chain_id_len + 8`.
pub fn parse_tss_pda_account(data: &[u8]) -> Result<TssPdaAccount, OutboundError> {
    if data.len() < 32 {
        return Err(OutboundError::TssPdaTooShort);
    }
    let tss_eth_address: [u8; 20] = data[8..28].try_into().unwrap();
    let chain_id_len = u32::from_le_bytes(data[28..32].try_into().unwrap()) as usize;

    if data.len() < 32 + chain_id_len + 8 {
        return Err(OutboundError::TssPdaTooShort);
    }
    let chain_id = std::str::from_utf8(&data[32..32 + chain_id_len])
        .map_err(|_| OutboundError::TssPdaInvalidChainId)?
        .to_string();

    let nonce_start = 32 + chain_id_len;
    let nonce = u64::from_le_bytes(data[nonce_start..nonce_start + 8].try_into().unwrap());

    let authority_start = nonce_start + 8;
    let authority = data
        .get(authority_start..authority_start + 32)
        .map(|slice| slice.try_into().unwrap());
    let bump = data.get(authority_start + 32).copied();

    Ok(TssPdaAccount {
        tss_eth_address,
        chain_id,
        nonce,
        authority,
        bump,
    })
}

fn writable_flags(accounts: &[GatewayAccountMeta]) -> Vec<u8> {
    let mut flags = vec![0u8; accounts.len().div_ceil(8)];
    for (index, account) in accounts.iter().enumerate() {
        if account.writable {
            flags[index / 8] |= 0x80 >> (index % 8);
        }
    }
    flags
}

/// The 8-account fixed prefix plus 8 sentinel-filled optional slots, as
/// `AccountMeta`s ready to append to a `withdraw_and_execute` instruction.
/// Spec §4.8: "unused slots MUST be filled with the gateway program address
/// itself as a sentinel".
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn build_fixed_account_list(
    gateway_program: &Pubkey,
    caller: &Pubkey,
    config_pda: &Pubkey,
    vault_pda: &Pubkey,
    cea_authority_pda: &Pubkey,
    tss_pda: &Pubkey,
    executed_tx_pda: &Pubkey,
    destination_program: &Pubkey,
    recipient: Option<&Pubkey>,
    mint: Option<&Pubkey>,
    token_vault: Option<&Pubkey>,
    recipient_ata: Option<&Pubkey>,
) -> Vec<AccountMeta> {
    let sentinel = *gateway_program;
    vec![
        AccountMeta::new(*caller, true),
        AccountMeta::new(*config_pda, false),
        AccountMeta::new(*vault_pda, false),
        AccountMeta::new_readonly(*cea_authority_pda, false),
        AccountMeta::new(*tss_pda, false),
        AccountMeta::new(*executed_tx_pda, false),
        AccountMeta::new_readonly(solana_sdk::system_program::ID, false),
        AccountMeta::new(*destination_program, false),
        AccountMeta::new(recipient.copied().unwrap_or(sentinel), recipient.is_some()),
        AccountMeta::new(mint.copied().unwrap_or(sentinel), false),
        AccountMeta::new(token_vault.copied().unwrap_or(sentinel), token_vault.is_some()),
        AccountMeta::new(
            recipient_ata.copied().unwrap_or(sentinel),
            recipient_ata.is_some(),
        ),
        AccountMeta::new_readonly(sentinel, false),
        AccountMeta::new_readonly(sentinel, false),
        AccountMeta::new_readonly(sentinel, false),
        AccountMeta::new_readonly(sentinel, false),
    ]
}

/// Anchor discriminator: first 8 bytes of `SHA256("global:" + method)`.
#[must_use]
pub fn anchor_discriminator(method: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{method}"));
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&digest[..8]);
    discriminator
}

/// Externally-produced TSS signature material, supplied by the caller once
/// the digest from [`tss::digest`] has been signed out of process.
#[derive(Debug, Clone)]
pub struct SignedTssResponse {
    pub signature: [u8; 64],
    pub claimed_address: String,
}

/// Builds the `withdraw_and_execute` Anchor instruction data (spec §4.8):
/// covers instruction ids 1 (withdraw) and 2 (execute) — both variants share
/// one on-chain method, differing only in whether the remaining-accounts /
/// ix_data sections are populated.
pub fn build_withdraw_and_execute_data(
    request: &OutboundSigningRequest,
    nonce: u64,
    response: &SignedTssResponse,
    message_hash: &[u8; 32],
) -> Result<Vec<u8>, OutboundError> {
    let recovery_id = tss::determine_recovery_id(
        message_hash,
        &response.signature,
        &response.claimed_address,
    )?;

    let mut data = Vec::new();
    data.extend_from_slice(&anchor_discriminator("withdraw_and_execute"));
    data.push(request.instruction_id);
    data.extend_from_slice(&request.tx_id);
    data.extend_from_slice(&request.universal_tx_id);
    data.extend_from_slice(&request.amount.to_le_bytes());
    data.extend_from_slice(&request.sender);

    let flags = writable_flags(&request.accounts);
    data.extend_from_slice(&(flags.len() as u32).to_le_bytes());
    data.extend_from_slice(&flags);

    data.extend_from_slice(&(request.ix_data.len() as u32).to_le_bytes());
    data.extend_from_slice(&request.ix_data);

    data.extend_from_slice(&request.gas_fee.to_le_bytes());
    data.extend_from_slice(&request.rent_fee.to_le_bytes());
    data.extend_from_slice(&response.signature);
    data.push(recovery_id);
    data.extend_from_slice(message_hash);
    data.extend_from_slice(&nonce.to_le_bytes());

    Ok(data)
}

/// Builds a `revert_universal_tx` (native, id 3) or `revert_universal_tx_token`
/// (SPL, id 4) Anchor instruction data.
pub fn build_revert_data(
    request: &OutboundSigningRequest,
    nonce: u64,
    response: &SignedTssResponse,
    message_hash: &[u8; 32],
    fund_recipient: &[u8; 32],
    revert_msg: &[u8],
) -> Result<Vec<u8>, OutboundError> {
    let method = match request.instruction_id {
        tss::instruction_id::REVERT_NATIVE => "revert_universal_tx",
        tss::instruction_id::REVERT_SPL => "revert_universal_tx_token",
        _ => return Err(OutboundError::UnsupportedTxType),
    };
    let recovery_id = tss::determine_recovery_id(
        message_hash,
        &response.signature,
        &response.claimed_address,
    )?;

    let mut data = Vec::new();
    data.extend_from_slice(&anchor_discriminator(method));
    data.extend_from_slice(&request.tx_id);
    data.extend_from_slice(&request.universal_tx_id);
    data.extend_from_slice(&request.amount.to_le_bytes());
    data.extend_from_slice(fund_recipient);
    data.extend_from_slice(&(revert_msg.len() as u32).to_le_bytes());
    data.extend_from_slice(revert_msg);
    data.extend_from_slice(&response.signature);
    data.push(recovery_id);
    data.extend_from_slice(message_hash);
    data.extend_from_slice(&nonce.to_le_bytes());

    Ok(data)
}

/// Compute-budget `SetComputeUnitLimit` instruction, defaulting to
/// [`DEFAULT_COMPUTE_UNIT_LIMIT`] when `requested` is `None` or zero.
#[must_use]
pub fn compute_budget_instruction(requested: Option<u32>) -> Instruction {
    let limit = requested.filter(|&limit| limit != 0).unwrap_or(DEFAULT_COMPUTE_UNIT_LIMIT);
    ComputeBudgetInstruction::set_compute_unit_limit(limit)
}

/// Assembles and signs the final transaction: compute-budget instruction
/// first, then the gateway instruction, fee payer and signer both the
/// relayer keypair, against `recent_blockhash` fetched via the RPC pool.
#[must_use]
pub fn assemble_transaction(
    gateway_instruction: Instruction,
    compute_unit_limit: Option<u32>,
    recent_blockhash: Hash,
    relayer: &Keypair,
) -> Transaction {
    let instructions = vec![compute_budget_instruction(compute_unit_limit), gateway_instruction];
    let message = Message::new(&instructions, Some(&relayer.pubkey()));
    Transaction::new(&[relayer], message, recent_blockhash)
}
