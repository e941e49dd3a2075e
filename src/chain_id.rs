//! CAIP-2 style chain identifiers for Solana-family chains.

/// Namespace component of the CAIP-2 identifier used by this core.
pub const NAMESPACE: &str = "solana";

/// Number of genesis-hash characters retained in a CAIP-2 chain id.
pub const REFERENCE_LEN: usize = 32;

/// Builds the `"solana:<first-32-chars-of-genesis-hash>"` identifier used to
/// key every persisted row and cursor.
#[must_use]
pub fn from_genesis_hash(genesis_hash: &str) -> String {
    let reference = truncate(genesis_hash);
    format!("{NAMESPACE}:{reference}")
}

/// Truncates a genesis hash string to the CAIP-2 reference length,
/// tolerating hashes shorter than that length.
fn truncate(genesis_hash: &str) -> &str {
    let end = genesis_hash
        .char_indices()
        .nth(REFERENCE_LEN)
        .map_or(genesis_hash.len(), |(idx, _)| idx);
    &genesis_hash[..end]
}

/// Parses the transaction signature out of an `event_id`, which is stored as
/// `"<signature>:<log-index>"` (or, for outbound confirmations, with extra
/// colon-separated suffixes). The signature is always the portion before the
/// first colon.
#[must_use]
pub fn signature_from_event_id(event_id: &str) -> &str {
    event_id.split_once(':').map_or(event_id, |(sig, _)| sig)
}
