//! Binary entry point: wires configuration, persistence, RPC pool and the
//! watcher/confirmer pair together and runs them until signalled to stop.
//!
//! Restart-on-failure loop grounded in `offchain/components/relayer/src/relayer.rs`'s
//! `SolanaToAxelarHandler::run` (a `JoinSet` of actors, restarted as a unit
//! whenever either task exits).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sol_gateway_relayer_core::chain_id;
use sol_gateway_relayer_core::config::{Args, Config};
use sol_gateway_relayer_core::confirmer::{DEFAULT_DENY_LIST_DISCRIMINATOR, OutboundConfirmer};
use sol_gateway_relayer_core::keypair;
use sol_gateway_relayer_core::rpc::RpcPool;
use sol_gateway_relayer_core::store::{PostgresStore, Store};
use sol_gateway_relayer_core::tracker::{LoggingVoteHandler, Tracker};
use sol_gateway_relayer_core::verifier::{RpcTransactionLookup, Verifier};
use sol_gateway_relayer_core::watcher::EventWatcher;
use solana_sdk::signature::Signer;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sol_gateway_relayer_core::init_tracing();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path).context("failed to load configuration file")?,
        None => Config::from_env().context("failed to load configuration from environment")?,
    };

    let store: Arc<dyn Store> = Arc::new(
        PostgresStore::connect(config.database_url.as_str())
            .await
            .context("failed to connect to the relayer database")?,
    );

    let rpc = Arc::new(
        RpcPool::new(&config.rpc_urls, config.expected_genesis_hash.as_deref())
            .await
            .context("failed to construct the rpc pool")?,
    );

    let cancellation = CancellationToken::new();

    let chain_id = match &config.expected_genesis_hash {
        Some(genesis_hash) => chain_id::from_genesis_hash(genesis_hash),
        None => {
            let genesis_hash = rpc
                .execute_with_failover(&cancellation, "getGenesisHash", |client| {
                    Box::pin(async move { client.get_genesis_hash().await.map_err(anyhow::Error::from) })
                })
                .await
                .context("failed to fetch genesis hash for chain id derivation")?;
            chain_id::from_genesis_hash(&genesis_hash.to_string())
        }
    };

    let relayer_keypair = keypair::load_relayer_keypair(&config.relayer_root)
        .context("failed to load relayer keypair")?;
    info!(relayer = %relayer_keypair.pubkey(), %chain_id, "starting relayer");

    let vote_handler = Arc::new(LoggingVoteHandler);
    let tracker = Arc::new(Tracker::with_thresholds(
        store.clone(),
        vote_handler,
        config.fast_confirmation_threshold,
        config.standard_confirmation_threshold,
    ));
    let lookup = RpcTransactionLookup::new(rpc.clone());
    let verifier = Arc::new(Verifier::new(store.clone(), lookup));

    let watcher = Arc::new(EventWatcher::new(
        chain_id.clone(),
        config.gateway_program,
        rpc.clone(),
        store.clone(),
        tracker.clone(),
        verifier.clone(),
        config.discriminators.clone(),
        config.poll_interval_secs.map(std::time::Duration::from_secs),
    ));

    let mut deny_list = HashSet::new();
    deny_list.insert(DEFAULT_DENY_LIST_DISCRIMINATOR.to_string());
    let confirmer = Arc::new(OutboundConfirmer::new(
        chain_id,
        store,
        tracker,
        verifier,
        deny_list,
        config.outbound_poll_interval_secs.map(std::time::Duration::from_secs),
    ));

    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                cancellation.cancel();
            }
        }
    });

    loop {
        let mut set = JoinSet::new();
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(
            sol_gateway_relayer_core::watcher::EVENT_CHANNEL_CAPACITY,
        );

        set.spawn({
            let watcher = watcher.clone();
            let cancellation = cancellation.clone();
            async move { watcher.run(cancellation, event_tx).await }
        });
        set.spawn({
            let confirmer = confirmer.clone();
            let cancellation = cancellation.clone();
            async move { confirmer.run(cancellation).await }
        });
        set.spawn(async move { while event_rx.recv().await.is_some() {} });

        tokio::select! {
            () = cancellation.cancelled() => {
                set.abort_all();
                break;
            }
            _ = set.join_next() => {
                error!("a relayer task exited unexpectedly, restarting the pair");
                set.abort_all();
            }
        }
    }

    info!("relayer shut down cleanly");
    Ok(())
}
