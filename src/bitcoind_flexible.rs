// JSON-RPC 2.0 over plain HTTP; works against Bitcoin Core and compatible endpoints.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use bitcoincore_rpc::bitcoin::{BlockHash, Txid};
use bitcoincore_rpc::{Error as RpcError, RpcApi};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

/// The upstream node calls the indexer consumes.
pub trait NodeRpc: Send + Sync {
    /// Ids of every transaction currently pending in the node's mempool.
    fn list_pending_txids(&self) -> Result<Vec<Txid>>;
    /// Raw serialized bytes of one transaction.
    fn fetch_raw_tx(&self, txid: &Txid) -> Result<Vec<u8>>;
    /// Tip hash; the polling feed treats a change as a confirmed block.
    fn best_block_hash(&self) -> Result<BlockHash>;
}

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u32,
    method: String,
    params: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorDetail>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorDetail {
    code: i32,
    message: String,
}

fn rpc_err(code: i32, message: String) -> RpcError {
    RpcError::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(
        bitcoincore_rpc::jsonrpc::error::RpcError { code, message, data: None },
    ))
}

pub struct FlexibleBitcoindClient {
    url: String,
    auth: Option<String>,
    client: reqwest::blocking::Client,
    request_id: AtomicU32,
}

impl FlexibleBitcoindClient {
    /// Must be built outside the async runtime (blocking reqwest).
    pub fn new(url: &str, auth: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        let auth_header = auth.map(|(user, pass)| {
            let credentials = format!("{}:{}", user, pass);
            format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(credentials))
        });

        Ok(Self { url: url.to_string(), auth: auth_header, client, request_id: AtomicU32::new(1) })
    }

    fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request =
            JsonRpcRequest { jsonrpc: "2.0".to_string(), id, method: method.to_string(), params };

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request);

        if let Some(ref auth) = self.auth {
            req = req.header("Authorization", auth);
        }

        let response =
            req.send().map_err(|e| rpc_err(-1, format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(rpc_err(status.as_u16() as i32, format!("HTTP {}: {}", status, body)));
        }

        let rpc_response: JsonRpcResponse<T> = response
            .json()
            .map_err(|e| rpc_err(-2, format!("Failed to parse JSON-RPC response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(rpc_err(error.code, error.message));
        }

        rpc_response
            .result
            .ok_or_else(|| rpc_err(-3, "Missing result field in response".to_string()))
    }
}

impl RpcApi for FlexibleBitcoindClient {
    fn call<T: for<'a> serde::de::Deserialize<'a>>(
        &self,
        cmd: &str,
        args: &[serde_json::Value],
    ) -> Result<T, RpcError> {
        self.rpc_call(cmd, args.to_vec())
    }
}

impl NodeRpc for FlexibleBitcoindClient {
    fn list_pending_txids(&self) -> Result<Vec<Txid>> {
        self.get_raw_mempool().context("bitcoind getrawmempool failed")
    }

    fn fetch_raw_tx(&self, txid: &Txid) -> Result<Vec<u8>> {
        let raw_hex = self
            .get_raw_transaction_hex(txid, None)
            .with_context(|| format!("bitcoind getrawtransaction {txid} failed"))?;
        hex::decode(raw_hex.trim()).with_context(|| format!("invalid hex for {txid}"))
    }

    fn best_block_hash(&self) -> Result<BlockHash> {
        self.get_best_block_hash().context("bitcoind getbestblockhash failed")
    }
}
