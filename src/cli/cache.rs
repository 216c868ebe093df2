//! Cache commands - one operation against the configured store

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::AppConfig;
use crate::infrastructure::cache::StoreFactory;
use crate::infrastructure::logging;
use crate::infrastructure::services::TaggedCache;

use super::{Cli, Command};

/// Run a parsed command line
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(backend) = cli.backend {
        config.store.backend = backend;
    }
    if let Some(url) = cli.redis_url {
        config.store.redis_url = Some(url);
    }

    logging::init_logging(&config.logging);

    let store = StoreFactory::new().create(&config.store_config()).await?;
    let cache = TaggedCache::with_config(store, config.cache_config());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(&cache, cli.command, &mut out).await
}

/// Executes `command` against `cache`, writing any output to `out`
pub async fn execute<W: Write>(
    cache: &TaggedCache,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            cache
                .set(&key, value.into_bytes(), Duration::from_secs(ttl), &tags)
                .await?;
            info!(key = %key, ttl_secs = ttl, tags = ?tags, "Value stored");
        }
        Command::Get { key } => {
            let value = cache.get(&key).await?;
            out.write_all(&value)?;
            writeln!(out)?;
        }
        Command::ClearByTag { tag } => {
            cache.clear_by_tag(&tag).await?;
            info!(tag = %tag, "Tag cleared");
        }
        Command::Delete { key } => {
            let existed = cache.delete(&key).await?;
            info!(key = %key, existed, "Key deleted");
        }
        Command::Tags { key } => {
            let tags = cache.tags(&key).await?;
            serde_json::to_writer(&mut *out, &tags)?;
            writeln!(out)?;
        }
    }

    out.flush()?;
    Ok(())
}
