//! Administration tool for the signing key ring
//!
//! Usage:
//!   cargo run --bin keyring-admin -- list
//!   cargo run --bin keyring-admin -- rotate --now
//!
//! Reads the same `KEYRING_*` configuration and `KEYRING_MASTER_KEY` as the
//! services sharing the key repository.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use keyring_config::{KeyRingConfig, ENV_PREFIX};
use keyring_rotation::{
    init_key_ring_provider, CacheableKeyRingProvider, Clock, KeyRingProvider, KeyState,
};
use serde::Serialize;
use std::path::PathBuf;

/// Signing key ring administration
#[derive(Parser)]
#[command(name = "keyring-admin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file, read before `KEYRING_*` environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every key in the repository
    List,

    /// Show the current key ring
    ShowRing,

    /// Create a new key
    Rotate {
        /// Make the new key the default right away instead of when the
        /// current default expires
        #[arg(long)]
        now: bool,
    },

    /// Revoke one key
    Revoke {
        key_id: String,
    },

    /// Revoke every key created before a point in time
    RevokeAll {
        /// RFC 3339 timestamp, defaults to now
        #[arg(long)]
        before: Option<DateTime<Utc>>,
    },

    /// Delete keys past their retention window
    Purge,
}

#[derive(Serialize)]
struct KeySummary {
    id: String,
    state: String,
    created_at: DateTime<Utc>,
    activation_date: DateTime<Utc>,
    expiration_date: DateTime<Utc>,
}

#[derive(Serialize)]
struct RingSummary {
    default_key: String,
    algorithm: String,
    valid_keys: Vec<String>,
    generated_at: DateTime<Utc>,
    cache_expires_at: DateTime<Utc>,
    rotation_due: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KeyRingConfig::load(Some(path.as_path()), ENV_PREFIX),
        None => KeyRingConfig::from_env(),
    }
    .context("Failed to load key ring configuration")?;

    keyring_logging::init_console_logging("keyring-admin", config.log_level());

    let provider = init_key_ring_provider(&config)
        .await
        .context("Failed to initialize key ring provider")?;

    run(cli.command, cli.json, &provider).await
}

async fn run(command: Commands, json: bool, provider: &KeyRingProvider) -> anyhow::Result<()> {
    let manager = provider.manager();

    match command {
        Commands::List => {
            let now = manager.clock().now();
            let mut records = manager.get_all_keys().await?;
            records.sort_by_key(|r| r.activation_date);

            let summaries: Vec<KeySummary> = records
                .into_iter()
                .map(|r| KeySummary {
                    state: format!("{:?}", KeyState::of(&r, now)),
                    id: r.id,
                    created_at: r.created_at,
                    activation_date: r.activation_date,
                    expiration_date: r.expiration_date,
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for key in &summaries {
                    println!(
                        "{}  {:<8}  {} -> {}",
                        key.id, key.state, key.activation_date, key.expiration_date
                    );
                }
                println!("{} key(s)", summaries.len());
            }
        }

        Commands::ShowRing => {
            let ring = provider.get_current_key_ring().await?;
            let summary = RingSummary {
                default_key: ring.default_key_id().to_string(),
                algorithm: ring.signing_credential().algorithm().to_string(),
                valid_keys: ring.valid_key_ids().map(str::to_string).collect(),
                generated_at: ring.generated_at(),
                cache_expires_at: ring.cache_expires_at(),
                rotation_due: ring.rotation_due(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Default key:  {} ({})", summary.default_key, summary.algorithm);
                println!("Valid keys:   {}", summary.valid_keys.join(", "));
                println!("Rotation due: {}", summary.rotation_due);
            }
        }

        Commands::Rotate { now } => {
            let record = if now {
                provider.rotate_now().await?
            } else {
                // Make sure a default exists to schedule against
                provider.get_current_key_ring().await?;
                provider.schedule_successor().await?
            };
            println!("Created key {} active from {}", record.id, record.activation_date);
        }

        Commands::Revoke { key_id } => {
            provider.revoke_key(&key_id).await?;
            println!("Revoked key {}", key_id);
        }

        Commands::RevokeAll { before } => {
            let before = before.unwrap_or_else(|| manager.clock().now());
            let revoked = manager.revoke_all_keys(before).await?;
            provider.invalidate_cache();
            println!("Revoked {} key(s) created before {}", revoked.len(), before);
        }

        Commands::Purge => {
            let purged = manager.purge_retired_keys(manager.clock().now()).await?;
            provider.invalidate_cache();
            for id in &purged {
                println!("Purged {}", id);
            }
            println!("Purged {} key(s)", purged.len());
        }
    }

    Ok(())
}
