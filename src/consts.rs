/// Height stamped on every record that belongs to the mempool projection.
pub const MEMPOOL_HEIGHT: u32 = u32::MAX;

/// Outpoint keys are `txid(32) ‖ vout(4, LE)`.
pub const OUTPOINT_KEY_LEN: usize = 36;

/// Fixed header of an encoded UTXO: height(4) ‖ position(8) ‖ satoshi(8).
pub const UTXO_HEADER_LEN: usize = 20;

/// Sequence value that marks an input as final.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Multiplier used to fold (height, position) into one sortable score.
pub const SCORE_HEIGHT_FACTOR: u64 = 1_000_000_000;

/// --- Tunables (edit as needed) ---
pub const RAW_TX_QUEUE_CAPACITY: usize = 1000;
pub const BLOCK_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 1000;
pub const DEFAULT_BLOCK_COALESCE_MS: u64 = 500;
pub const DEFAULT_FEED_POLL_MS: u64 = 1000;
pub const FEED_FETCH_CONCURRENCY: usize = 8;
pub const SUMMARY_COMMIT_ATTEMPTS: usize = 3;
pub const RECORD_POOL_MAX_IDLE: usize = 100_000;
/// Carryover entries listed per cycle at debug level.
pub const CARRYOVER_DUMP_LIMIT: usize = 50;
/// Payloads shorter than this (and not 32 bytes) are topic / sequence framing.
pub const MIN_RAW_TX_PAYLOAD: usize = 10;
/// --- End tunables ---

/// Projection namespace, before key grouping is applied.
pub const PROJECTION_NS: &str = "mp";

/// Secondary structure prefixes (appended to the projection namespace).
pub const K_UTXO: &[u8] = b":utxo";
pub const K_ADDR_UTXO: &[u8] = b":au";
pub const K_BALANCE: &[u8] = b":balance";
pub const K_NFT_UTXO: &[u8] = b":nu";
pub const K_NFT_OWNERS: &[u8] = b":no";
pub const K_NFT_SUMMARY: &[u8] = b":ns";
pub const K_FT_UTXO: &[u8] = b":fu";
pub const K_FT_BALANCE: &[u8] = b":fb";
pub const K_FT_SUMMARY: &[u8] = b":fs";
pub const K_SPENT_UTXO: &[u8] = b":s:utxo";
pub const K_SPENT_ADDR_UTXO: &[u8] = b":s:au";
pub const K_SPENT_NFT_UTXO: &[u8] = b":s:nu";
pub const K_SPENT_FT_UTXO: &[u8] = b":s:fu";
