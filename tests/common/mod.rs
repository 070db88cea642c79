// Common utilities for integration tests

mod test_harness;

#[allow(unused_imports)]
pub use mempool_indexer::test_utils::{MockNode, TxBuilder, scripts};

pub use test_harness::MempoolTestHarness;
