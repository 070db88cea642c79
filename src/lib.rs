pub mod consts;
pub mod schemas;
pub mod utils;

pub mod bitcoind_flexible;
pub mod config;
pub mod core;
pub mod runtime;

// Shared by unit tests and the integration tests under tests/
pub mod test_utils;
