//! CLI module for recache
//!
//! Each invocation builds a store from configuration, runs one command and exits.
//! The in-memory backend therefore only lives for the duration of a single command;
//! use `--backend redis` to share entries between invocations.

pub mod cache;

use clap::{Parser, Subcommand};

use crate::infrastructure::cache::StoreType;

/// recache - TTL cache entries with tag-based invalidation
#[derive(Parser)]
#[command(name = "recache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Store backend, overrides configuration (in_memory, redis)
    #[arg(long, global = true)]
    pub backend: Option<StoreType>,

    /// Redis connection URL, overrides configuration
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store a value under a key
    Set {
        key: String,
        value: String,

        /// Time to live in seconds, 0 keeps the entry until removed
        #[arg(long, default_value_t = 0)]
        ttl: u64,

        /// Tag to attach, repeat for several
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Print the value stored under a key
    Get { key: String },

    /// Remove every entry carrying a tag
    ClearByTag { tag: String },

    /// Remove a single key
    Delete { key: String },

    /// Print the tags attached to a key as a JSON array
    Tags { key: String },
}
