//! Configuration (A1): environment-driven settings for a single chain
//! deployment of this core, plus the CLI entry point a binary target wires
//! up. Mirrors `offchain/components/relayer/src/config.rs`'s
//! `ConfigEnv`/`Config` split — a flat env-sourced struct validated and
//! reshaped into the struct the rest of the crate consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use url::Url;

use crate::events::{ConfirmationType, DiscriminatorTable, EventDescriptor};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a TOML file carrying deployment-specific overrides (event
    /// discriminator table location, thresholds); environment variables
    /// always take precedence over this file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Figment(#[from] figment::Error),
    #[error("invalid rpc_urls: must be a non-empty comma-separated list")]
    EmptyRpcUrls,
    #[error("failed to parse rpc url '{url}': {source}")]
    InvalidRpcUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to parse discriminator table at {path}: {source}")]
    DiscriminatorTableParse {
        path: PathBuf,
        #[source]
        source: figment::Error,
    },
}

/// Flat, directly-deserializable view of the environment, matching
/// `ConfigEnv`'s role in the teacher.
#[derive(Debug, Deserialize)]
pub struct ConfigEnv {
    pub database_url: Url,
    /// Comma-separated list of RPC endpoint URLs.
    pub rpc_urls: String,
    /// Expected genesis hash (may be pre-truncated to the CAIP-2 reference
    /// length); omit to skip genesis validation at pool construction.
    pub expected_genesis_hash: Option<String>,
    #[serde(deserialize_with = "deserialize_pubkey")]
    pub gateway_program: Pubkey,
    /// Deployment root containing `relayer/solana.json`.
    pub relayer_root: PathBuf,
    pub poll_interval_secs: Option<u64>,
    pub outbound_poll_interval_secs: Option<u64>,
    pub fast_confirmation_threshold: Option<u64>,
    pub standard_confirmation_threshold: Option<u64>,
    /// Path to a TOML side-file mapping discriminator hex to
    /// `{method_name, confirmation_type}` (spec §4.2's "configuration-supplied
    /// map").
    pub discriminators_path: PathBuf,
}

impl ConfigEnv {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new().merge(Env::prefixed("GATEWAY_")).extract()
    }
}

/// Validated settings consumed by the rest of the crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Url,
    pub rpc_urls: Vec<Url>,
    pub expected_genesis_hash: Option<String>,
    pub gateway_program: Pubkey,
    pub relayer_root: PathBuf,
    pub poll_interval_secs: Option<u64>,
    pub outbound_poll_interval_secs: Option<u64>,
    pub fast_confirmation_threshold: u64,
    pub standard_confirmation_threshold: u64,
    pub discriminators: DiscriminatorTable,
}

impl Config {
    /// Loads from `GATEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = ConfigEnv::load()?;
        Self::from_env_struct(env)
    }

    /// Loads from a TOML file, with `GATEWAY_*` environment variables
    /// overriding any key it sets — matching the relative precedence of
    /// `figment`'s provider merge order.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let env = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_"))
            .extract::<ConfigEnv>()?;
        Self::from_env_struct(env)
    }

    fn from_env_struct(env: ConfigEnv) -> Result<Self, ConfigError> {
        let rpc_urls = env
            .rpc_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|raw| {
                Url::parse(raw).map_err(|source| ConfigError::InvalidRpcUrl {
                    url: raw.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if rpc_urls.is_empty() {
            return Err(ConfigError::EmptyRpcUrls);
        }

        let discriminators = load_discriminator_table(&env.discriminators_path)?;

        Ok(Self {
            database_url: env.database_url,
            rpc_urls,
            expected_genesis_hash: env.expected_genesis_hash,
            gateway_program: env.gateway_program,
            relayer_root: env.relayer_root,
            poll_interval_secs: env.poll_interval_secs,
            outbound_poll_interval_secs: env.outbound_poll_interval_secs,
            fast_confirmation_threshold: env.fast_confirmation_threshold.unwrap_or(0),
            standard_confirmation_threshold: env.standard_confirmation_threshold.unwrap_or(0),
            discriminators,
        })
    }
}

/// On-disk shape of a single discriminator table entry.
#[derive(Debug, Deserialize)]
struct RawEventDescriptor {
    method_name: String,
    confirmation_type: RawConfirmationType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum RawConfirmationType {
    Fast,
    Standard,
}

#[derive(Debug, Deserialize)]
struct RawDiscriminatorTable {
    #[serde(flatten)]
    entries: HashMap<String, RawEventDescriptor>,
}

fn load_discriminator_table(path: &Path) -> Result<DiscriminatorTable, ConfigError> {
    let raw: RawDiscriminatorTable = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .map_err(|source| ConfigError::DiscriminatorTableParse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(raw
        .entries
        .into_iter()
        .map(|(discriminator, descriptor)| {
            let confirmation_type = match descriptor.confirmation_type {
                RawConfirmationType::Fast => ConfirmationType::Fast,
                RawConfirmationType::Standard => ConfirmationType::Standard,
            };
            (
                discriminator,
                EventDescriptor {
                    method_name: descriptor.method_name,
                    confirmation_type,
                },
            )
        })
        .collect())
}

fn deserialize_pubkey<'de, D>(deserializer: D) -> Result<Pubkey, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Pubkey::from_str(&s).map_err(serde::de::Error::custom)
}
