pub mod analytic;
pub mod carryover;
pub mod dump;
pub mod mdb;
pub mod mempool;
pub mod parallel;
pub mod record_pool;
pub mod serial;
pub mod sync;
pub mod utxo_cache;
