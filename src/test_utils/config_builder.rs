use crate::config::AppConfig;
use tempfile::TempDir;

/// Builder for test `AppConfig`s whose paths live in a temporary directory.
/// Timings are short so streaming cycles close quickly.
pub struct TestConfigBuilder {
    config: AppConfig,
    temp_dir: TempDir,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = temp_dir.path();
        let path = |name: &str| root.join(name).to_string_lossy().to_string();

        let config = AppConfig {
            bitcoind_rpc_url: "http://127.0.0.1:8332".to_string(), // Placeholder
            bitcoind_rpc_user: "test".to_string(),
            bitcoind_rpc_pass: "test".to_string(),
            cache_db_path: path("cache"),
            store_path: path("mempool.sqlite"),
            dump_dir: path("dump"),
            feed_poll_ms: 20,
            idle_timeout_ms: 40,
            batch_window_ms: 500,
            block_coalesce_ms: 10,
            parallel_workers: 4,
            key_grouping: "none".to_string(),
            dump: false,
            sync: true,
            full: true,
            utxo: true,
        };

        Self { config, temp_dir }
    }

    pub fn with_utxo(mut self, enabled: bool) -> Self {
        self.config.utxo = enabled;
        self
    }

    /// Start in INCREMENTAL instead of FULL.
    pub fn with_full(mut self, enabled: bool) -> Self {
        self.config.full = enabled;
        self
    }

    pub fn with_dump(mut self, enabled: bool) -> Self {
        self.config.dump = enabled;
        self
    }

    pub fn with_key_grouping(mut self, grouping: &str) -> Self {
        self.config.key_grouping = grouping.to_string();
        self
    }

    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    /// Validate (creating directories) and hand back the config with its temp dir.
    /// Keep the `TempDir` alive for as long as the paths are in use.
    pub fn build(self) -> (AppConfig, TempDir) {
        self.config.validate().expect("test config is valid");
        (self.config, self.temp_dir)
    }
}
