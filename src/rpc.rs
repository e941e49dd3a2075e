//! RPC pool with round-robin failover over untrusted Solana endpoints.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// Per-endpoint RPC timeout applied at pool construction.
pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RpcPoolError {
    #[error("no endpoint passed liveness/genesis checks")]
    NoHealthyEndpoint,
    #[error("operation cancelled")]
    Cancelled,
    #[error("all {attempts} attempts against the pool failed, last error: {source}")]
    OperationExhausted {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// A single RPC endpoint: its URL and a client handle bound to it.
pub struct Endpoint {
    pub url: Url,
    pub client: RpcClient,
}

impl Endpoint {
    fn new(url: Url) -> Self {
        let client = RpcClient::new_with_timeout_and_commitment(
            url.to_string(),
            ENDPOINT_TIMEOUT,
            CommitmentConfig::confirmed(),
        );
        Self { url, client }
    }
}

/// Ordered set of endpoints with best-effort round-robin failover.
///
/// Construction admits only endpoints that answer `getHealth` with `"ok"`
/// and, when an expected genesis hash is configured, whose genesis hash
/// (truncated to the expected length) matches. Construction fails if no
/// endpoint is admitted.
pub struct RpcPool {
    endpoints: Vec<Endpoint>,
    next: AtomicU64,
}

impl RpcPool {
    /// Builds a pool from a list of endpoint URLs, validating liveness and
    /// (if `expected_genesis_hash` is set) genesis hash at construction.
    #[tracing::instrument(skip(urls))]
    pub async fn new(
        urls: &[Url],
        expected_genesis_hash: Option<&str>,
    ) -> Result<Self, RpcPoolError> {
        let mut endpoints = Vec::new();
        for url in urls {
            let endpoint = Endpoint::new(url.clone());
            if endpoint.client.get_health().await.is_err() {
                warn!(%url, "endpoint failed getHealth check, skipping");
                continue;
            }
            if let Some(expected) = expected_genesis_hash {
                match endpoint.client.get_genesis_hash().await {
                    Ok(actual) => {
                        let actual = actual.to_string();
                        let truncated = &actual[..actual.len().min(expected.len())];
                        if truncated != expected {
                            warn!(%url, %actual, expected, "genesis hash mismatch, skipping");
                            continue;
                        }
                    }
                    Err(error) => {
                        // Admit the endpoint anyway: a transient genesis-hash
                        // fetch failure should not take down the whole pool.
                        warn!(%url, %error, "failed to fetch genesis hash, admitting endpoint anyway");
                    }
                }
            }
            endpoints.push(endpoint);
        }

        if endpoints.is_empty() {
            return Err(RpcPoolError::NoHealthyEndpoint);
        }

        Ok(Self {
            endpoints,
            next: AtomicU64::new(0),
        })
    }

    /// Number of endpoints currently held by the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Invokes `operation` against endpoints in round-robin order until it
    /// succeeds or every endpoint has been tried once.
    ///
    /// The round-robin index is advanced with a single fetch-and-add per
    /// attempt, so concurrent callers never deliberately target the same
    /// endpoint on the same attempt, though fairness across calls is only
    /// best-effort.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        cancellation: &CancellationToken,
        operation_name: &'static str,
        mut operation: F,
    ) -> Result<T, RpcPoolError>
    where
        F: FnMut(&RpcClient) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.endpoints.len();
        let mut last_error: Option<anyhow::Error> = None;

        for _ in 0..attempts {
            if cancellation.is_cancelled() {
                return Err(RpcPoolError::Cancelled);
            }

            let index = self.next.fetch_add(1, Ordering::Relaxed) as usize % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            match operation(&endpoint.client).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(
                        operation = operation_name,
                        url = %endpoint.url,
                        %error,
                        "rpc call failed, advancing to next endpoint"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(RpcPoolError::OperationExhausted {
            attempts,
            source: last_error.unwrap_or_else(|| anyhow::anyhow!("empty pool")),
        })
    }
}

/// Wraps a single `getSlot` call; the runtime `IsHealthy` probe (§6), kept
/// distinct from the `getHealth` check gating pool construction above.
pub async fn is_healthy(client: &RpcClient) -> bool {
    client.get_slot().await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_index_wraps_with_pool_size() {
        let next = AtomicU64::new(u64::MAX);
        let index = next.fetch_add(1, Ordering::Relaxed) as usize % 3;
        // u64::MAX + 1 wraps to 0, benign per the design notes.
        assert_eq!(index, 0);
    }
}
