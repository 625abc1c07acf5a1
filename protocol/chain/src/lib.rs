use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use engine::Handle;
use fhe_counter::{decode_count, get_count_calldata, CounterCall};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub mod devnet;
pub mod jsonrpc;

pub use devnet::{Devnet, DevnetSigner};
pub use jsonrpc::{JsonRpcClient, JsonRpcSigner};

pub type TxHash = B256;

/// EIP-1193 "user rejected request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// Symbolic rejection code used by ethers-style wallets.
pub const ACTION_REJECTED: &str = "ACTION_REJECTED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Numeric(i64),
    Symbolic(String),
}

impl ErrorCode {
    fn is_user_rejection(&self) -> bool {
        match self {
            ErrorCode::Numeric(code) => *code == USER_REJECTED_CODE,
            ErrorCode::Symbolic(code) => code == ACTION_REJECTED,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Numeric(code) => write!(f, "{code}"),
            ErrorCode::Symbolic(code) => f.write_str(code),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("wallet error: {message}")]
    Wallet {
        code: Option<ErrorCode>,
        cause: Option<ErrorCode>,
        message: String,
    },
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        cause: Option<ErrorCode>,
        message: String,
    },
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    #[error("no receipt for {0} after {1:?}")]
    ReceiptTimeout(TxHash, Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ChainError {
    pub fn user_rejected(message: impl Into<String>) -> Self {
        ChainError::Wallet {
            code: Some(ErrorCode::Numeric(USER_REJECTED_CODE)),
            cause: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    UserCancelled,
    Failed,
}

/// Sorts a wallet or chain failure into the closed set the client reports on.
pub fn classify(err: &ChainError) -> FailureClass {
    let rejected = match err {
        ChainError::Wallet { code, cause, .. } => code
            .iter()
            .chain(cause.iter())
            .any(ErrorCode::is_user_rejection),
        ChainError::Rpc { code, cause, .. } => {
            *code == USER_REJECTED_CODE || cause.as_ref().is_some_and(ErrorCode::is_user_rejection)
        }
        _ => false,
    };
    if rejected {
        FailureClass::UserCancelled
    } else {
        FailureClass::Failed
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;
    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError>;
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ChainError>;
}

/// A connected wallet account.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;
    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, ChainError>;
    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, ChainError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalityConfig {
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Polls for the receipt of `hash` until it lands. A failed receipt is `Reverted`.
pub async fn wait_for_finality(
    client: &dyn ChainClient,
    hash: TxHash,
    config: &FinalityConfig,
) -> Result<Receipt, ChainError> {
    let started = tokio::time::Instant::now();
    loop {
        if let Some(receipt) = client.transaction_receipt(hash).await? {
            if !receipt.success {
                return Err(ChainError::Reverted(hash));
            }
            info!(tx = %hash, block = receipt.block_number, "transaction final");
            return Ok(receipt);
        }
        if let Some(timeout) = config.timeout {
            if started.elapsed() >= timeout {
                return Err(ChainError::ReceiptTimeout(hash, timeout));
            }
        }
        debug!(tx = %hash, "receipt pending");
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Typed view of a deployed counter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterContract {
    address: Address,
}

impl CounterContract {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn get_count(&self, client: &dyn ChainClient) -> Result<Handle, ChainError> {
        let request = CallRequest {
            from: None,
            to: self.address,
            data: get_count_calldata(),
        };
        let raw = client.call(&request).await?;
        decode_count(&raw).map_err(|e| ChainError::Decode(e.to_string()))
    }

    pub async fn submit(&self, signer: &dyn Signer, call: &CounterCall) -> Result<TxHash, ChainError> {
        let request = TransactionRequest {
            from: signer.address(),
            to: self.address,
            data: call.calldata(),
        };
        let hash = signer.send_transaction(request).await?;
        info!(contract = %self.address, call = call.name(), tx = %hash, "submitted");
        Ok(hash)
    }
}
