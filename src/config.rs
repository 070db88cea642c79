use crate::consts::{
    DEFAULT_BATCH_WINDOW_MS, DEFAULT_BLOCK_COALESCE_MS, DEFAULT_FEED_POLL_MS,
    DEFAULT_IDLE_TIMEOUT_MS,
};
use crate::runtime::mempool::StreamOptions;
use crate::runtime::serial::{ResolveOptions, default_workers};
use crate::runtime::sync::{SyncOptions, SyncState};
use crate::runtime::utxo_cache::{KeyGrouping, parse_key_grouping};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::{fs, path::Path, sync::OnceLock, time::Duration};

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

fn default_cache_db_path() -> String {
    "./db/cache".to_string()
}

fn default_store_path() -> String {
    "./db/mempool.sqlite".to_string()
}

fn default_dump_dir() -> String {
    "./dump".to_string()
}

fn default_feed_poll_ms() -> u64 {
    DEFAULT_FEED_POLL_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_batch_window_ms() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}

fn default_block_coalesce_ms() -> u64 {
    DEFAULT_BLOCK_COALESCE_MS
}

fn default_key_grouping() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub bitcoind_rpc_url: String,
    #[serde(default)]
    pub bitcoind_rpc_user: String,
    #[serde(default)]
    pub bitcoind_rpc_pass: String,
    #[serde(default = "default_cache_db_path")]
    pub cache_db_path: String,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
    #[serde(default = "default_feed_poll_ms")]
    pub feed_poll_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_block_coalesce_ms")]
    pub block_coalesce_ms: u64,
    /// 0 = available parallelism.
    #[serde(default)]
    pub parallel_workers: usize,
    #[serde(default = "default_key_grouping")]
    pub key_grouping: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bitcoind_rpc_url: String,
    pub bitcoind_rpc_user: String,
    pub bitcoind_rpc_pass: String,
    pub cache_db_path: String,
    pub store_path: String,
    pub dump_dir: String,
    pub feed_poll_ms: u64,
    pub idle_timeout_ms: u64,
    pub batch_window_ms: u64,
    pub block_coalesce_ms: u64,
    pub parallel_workers: usize,
    pub key_grouping: String,
    pub dump: bool,
    pub sync: bool,
    pub full: bool,
    pub utxo: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to JSON config file.
    #[arg(long, default_value = "./config.json")]
    pub config_path: String,

    /// Append committed rows as JSON lines under `dump_dir`.
    #[arg(long, default_value_t = false)]
    pub dump: bool,

    /// Write to the analytic store and keep syncing; otherwise run one cycle.
    #[arg(long, default_value_t = false)]
    pub sync: bool,

    /// Start with a FULL resync instead of streaming.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub full: bool,

    /// Track the UTXO set; off writes only tx and output rows.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub utxo: bool,
}

fn load_config_file(path: &str) -> Result<ConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    serde_json::from_str(&raw).context("failed to parse config JSON")
}

fn ensure_dir(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {what} {}: {e}", path.display()))?;
    } else if !path.is_dir() {
        anyhow::bail!("{what} is not a directory: {}", path.display());
    }
    Ok(())
}

impl AppConfig {
    pub fn from_file(file: ConfigFile, cli: &CliArgs) -> Result<Self> {
        let parallel_workers =
            if file.parallel_workers == 0 { default_workers() } else { file.parallel_workers };
        Ok(Self {
            bitcoind_rpc_url: file.bitcoind_rpc_url.trim().to_string(),
            bitcoind_rpc_user: file.bitcoind_rpc_user,
            bitcoind_rpc_pass: file.bitcoind_rpc_pass,
            cache_db_path: file.cache_db_path,
            store_path: file.store_path,
            dump_dir: file.dump_dir,
            feed_poll_ms: file.feed_poll_ms,
            idle_timeout_ms: file.idle_timeout_ms,
            batch_window_ms: file.batch_window_ms,
            block_coalesce_ms: file.block_coalesce_ms,
            parallel_workers,
            key_grouping: file.key_grouping,
            dump: cli.dump,
            sync: cli.sync,
            full: cli.full,
            utxo: cli.utxo,
        })
    }

    /// Checks paths and timings, creating missing directories.
    pub fn validate(&self) -> Result<()> {
        if self.bitcoind_rpc_url.is_empty() {
            anyhow::bail!("bitcoind_rpc_url must be provided");
        }
        ensure_dir(Path::new(&self.cache_db_path), "cache_db_path")?;
        if self.sync {
            if let Some(parent) = Path::new(&self.store_path).parent() {
                if !parent.as_os_str().is_empty() {
                    ensure_dir(parent, "store_path parent")?;
                }
            }
        }
        if self.dump {
            ensure_dir(Path::new(&self.dump_dir), "dump_dir")?;
        }
        for (name, v) in [
            ("feed_poll_ms", self.feed_poll_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("batch_window_ms", self.batch_window_ms),
        ] {
            if v == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }
        parse_key_grouping(&self.key_grouping)?;
        Ok(())
    }

    pub fn rpc_auth(&self) -> Option<(String, String)> {
        if !self.bitcoind_rpc_user.is_empty() && !self.bitcoind_rpc_pass.is_empty() {
            Some((self.bitcoind_rpc_user.clone(), self.bitcoind_rpc_pass.clone()))
        } else {
            None
        }
    }

    pub fn key_grouping(&self) -> Result<Box<dyn KeyGrouping>> {
        parse_key_grouping(&self.key_grouping)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_ms)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            batch_window: Duration::from_millis(self.batch_window_ms),
            block_coalesce: Duration::from_millis(self.block_coalesce_ms),
        }
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions { track_utxo: self.utxo, workers: self.parallel_workers.max(1) }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            initial: if self.full { SyncState::Full } else { SyncState::Incremental },
            run_forever: self.sync,
            stream: self.stream_options(),
        }
    }
}

pub fn init_config_from(cfg: AppConfig) -> Result<()> {
    cfg.validate()?;
    CONFIG
        .set(cfg)
        .map_err(|_| anyhow::anyhow!("config already initialized"))?;
    Ok(())
}

pub fn init_config() -> Result<()> {
    let cli = CliArgs::parse();
    let file = load_config_file(&cli.config_path)?;
    let cfg = AppConfig::from_file(file, &cli)?;
    init_config_from(cfg)
}

pub fn get_config() -> Option<&'static AppConfig> {
    CONFIG.get()
}
