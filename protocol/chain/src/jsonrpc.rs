use crate::{CallRequest, ChainClient, ChainError, ErrorCode, Receipt, Signer, TransactionRequest, TxHash};
use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    block_number: Option<String>,
    status: Option<String>,
}

/// Ethereum JSON-RPC over HTTP.
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        debug!(method, id, "json-rpc request");
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                cause: nested_code(err.data.as_ref()),
                message: err.message,
            });
        }
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| ChainError::Decode(format!("{method}: {e}")))
    }
}

// Wallets bury the original provider error under `data`, `data.error` or `data.originalError`.
fn nested_code(data: Option<&Value>) -> Option<ErrorCode> {
    let data = data?;
    let candidates = [
        data.get("code"),
        data.get("error").and_then(|e| e.get("code")),
        data.get("originalError").and_then(|e| e.get("code")),
    ];
    candidates.into_iter().flatten().find_map(|code| match code {
        Value::Number(n) => n.as_i64().map(ErrorCode::Numeric),
        Value::String(s) => Some(ErrorCode::Symbolic(s.clone())),
        _ => None,
    })
}

fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("quantity {raw:?}: {e}")))
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        let mut tx = json!({ "to": request.to, "data": request.data });
        if let Some(from) = request.from {
            tx["from"] = json!(from);
        }
        self.request("eth_call", json!([tx, "latest"])).await
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // Receipts without a block number are still pending on some nodes.
        let Some(block) = raw.block_number else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            transaction_hash: raw.transaction_hash,
            block_number: parse_quantity(&block)?,
            success: raw.status.as_deref().map(parse_quantity).transpose()? != Some(0),
        }))
    }
}

/// Account managed by the node behind a [`JsonRpcClient`] (`eth_sign`, `eth_sendTransaction`).
pub struct JsonRpcSigner {
    client: Arc<JsonRpcClient>,
    address: Address,
}

impl JsonRpcSigner {
    pub fn new(client: Arc<JsonRpcClient>, address: Address) -> Self {
        Self { client, address }
    }
}

#[async_trait]
impl Signer for JsonRpcSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, ChainError> {
        let payload = format!("0x{}", hex::encode(message));
        self.client
            .request("eth_sign", json!([self.address, payload]))
            .await
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, ChainError> {
        let tx = json!({ "from": request.from, "to": request.to, "data": request.data });
        self.client.request("eth_sendTransaction", json!([tx])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_rejection_codes_are_found() {
        let data = json!({ "originalError": { "code": 4001, "message": "denied" } });
        assert_eq!(nested_code(Some(&data)), Some(ErrorCode::Numeric(4001)));
        let data = json!({ "code": "ACTION_REJECTED" });
        assert_eq!(
            nested_code(Some(&data)),
            Some(ErrorCode::Symbolic("ACTION_REJECTED".into()))
        );
        assert_eq!(nested_code(Some(&json!("0xdeadbeef"))), None);
        assert_eq!(nested_code(None), None);
    }

    #[test]
    fn quantities_parse_as_hex() {
        assert_eq!(parse_quantity("0x7a69").unwrap(), 31337);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn receipts_decode_from_node_json() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x10",
            "status": "0x1"
        }))
        .unwrap();
        assert_eq!(raw.block_number.as_deref(), Some("0x10"));
        assert_eq!(raw.status.as_deref(), Some("0x1"));
    }
}
