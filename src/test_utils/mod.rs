// Test utilities shared by unit and integration tests

pub use tempfile::TempDir;

pub mod config_builder;
pub mod mock_node;
pub mod tx_builder;

pub use config_builder::TestConfigBuilder;
pub use mock_node::MockNode;
pub use tx_builder::{TxBuilder, scripts};
