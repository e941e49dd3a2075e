//! Solana gateway client core.
//!
//! Observes a gateway program deployed on a Solana-family chain, decodes its
//! Anchor/Borsh event log payloads, tracks observed transactions through
//! Solana's probabilistic confirmation lifecycle, and assembles/signs
//! outbound transactions back onto the gateway on behalf of a threshold
//! signature service (TSS).
//!
//! This crate supports exactly one on-chain program (the gateway) and does
//! not aim to be a general Solana SDK.

pub mod chain_id;
pub mod confirmer;
pub mod config;
pub mod events;
pub mod keypair;
pub mod outbound;
pub mod rpc;
pub mod store;
pub mod tracker;
pub mod tss;
pub mod verifier;
pub mod watcher;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a `tracing` subscriber reading `RUST_LOG`, defaulting to `info`.
///
/// Binary targets should call this once at startup. Library consumers that
/// already own a subscriber should not call it.
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .init();
}
