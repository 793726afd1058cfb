//! Configuration for bellrockd

use bellrock_store::MasterKey;
use clap::Parser;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// bellrockd - Bellrock beacon resolution daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "bellrockd")]
#[command(about = "Anonymous beacon registration and resolution daemon")]
pub struct Config {
    /// Listen address for ingest connections
    #[arg(short, long, default_value = "0.0.0.0:9310")]
    pub listen: SocketAddr,

    /// Directory for the main relational store
    #[arg(short, long, default_value = "./data/bellrock/main")]
    pub data_dir: PathBuf,

    /// Directory for the segregated key store
    #[arg(long, default_value = "./data/bellrock/keys")]
    pub keystore_dir: PathBuf,

    /// Serialized cell-tower map (omit to start with an empty map)
    #[arg(long)]
    pub tower_map: Option<PathBuf>,

    /// Master key for the key store, 32 hex-encoded bytes
    #[arg(long, env = "BELLROCK_MASTER_KEY")]
    pub master_key: String,

    /// Recent-acquaintance window capacity per observer
    #[arg(long, default_value = "1000")]
    pub lru_capacity: NonZeroUsize,

    /// Buffered rows that force an early commit
    #[arg(long, default_value = "5000")]
    pub commit_buffer: usize,

    /// Seconds between background commits
    #[arg(long, default_value = "5")]
    pub commit_interval_secs: u64,

    /// Resolver worker threads (0 = one per core)
    #[arg(long, default_value = "0")]
    pub workers: usize,

    /// Candidate-set size above which trial decryption fans out to the pool
    #[arg(long, default_value = "64")]
    pub parallel_threshold: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(e) = MasterKey::from_hex(&self.master_key) {
            anyhow::bail!("invalid master key: {e}");
        }
        if self.data_dir == self.keystore_dir {
            anyhow::bail!("main store and key store must not share a directory");
        }
        if self.commit_interval_secs == 0 {
            anyhow::bail!("commit interval must be at least one second");
        }
        Ok(())
    }

    /// Parsed at-rest master key.
    pub fn master_key(&self) -> anyhow::Result<MasterKey> {
        MasterKey::from_hex(&self.master_key).map_err(Into::into)
    }
}
