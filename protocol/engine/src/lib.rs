use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod mock;

pub use mock::{Coprocessor, MockEngine};

/// Opaque 32-byte reference to an encrypted value held by the coprocessor.
pub type Handle = B256;

pub const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedOperand {
    pub handle: Handle,
    pub proof: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleContractPair {
    pub handle: Handle,
    pub contract_address: Address,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionKeypair {
    pub public_key: Bytes,
    pub private_key: Bytes,
}

impl fmt::Debug for DecryptionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKeypair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// What the user signs to allow local decryption for a set of contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub public_key: Bytes,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

impl AuthorizationRequest {
    pub fn new(
        public_key: Bytes,
        contract_addresses: &[Address],
        user_address: Address,
        start_timestamp: u64,
        duration_days: u32,
    ) -> Self {
        Self {
            public_key,
            contract_addresses: normalize_contracts(contract_addresses),
            user_address,
            start_timestamp,
            duration_days,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = b"fhe-counter/user-decrypt/v1".to_vec();
        buf.extend_from_slice(&(self.public_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&(self.contract_addresses.len() as u32).to_be_bytes());
        for contract in &self.contract_addresses {
            buf.extend_from_slice(contract.as_slice());
        }
        buf.extend_from_slice(self.user_address.as_slice());
        buf.extend_from_slice(&self.start_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.duration_days.to_be_bytes());
        buf
    }
}

/// Signed, time-bounded grant allowing the holder to decrypt handles of the listed
/// contracts on behalf of `user_address`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionAuthorization {
    pub public_key: Bytes,
    pub private_key: Bytes,
    pub signature: Bytes,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

impl fmt::Debug for DecryptionAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionAuthorization")
            .field("user_address", &self.user_address)
            .field("contract_addresses", &self.contract_addresses)
            .field("start_timestamp", &self.start_timestamp)
            .field("duration_days", &self.duration_days)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl DecryptionAuthorization {
    pub fn expires_at(&self) -> u64 {
        self.start_timestamp
            .saturating_add(u64::from(self.duration_days).saturating_mul(SECONDS_PER_DAY))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    pub fn covers(&self, contract: &Address) -> bool {
        self.contract_addresses.contains(contract)
    }

    pub fn request(&self) -> AuthorizationRequest {
        AuthorizationRequest {
            public_key: self.public_key.clone(),
            contract_addresses: self.contract_addresses.clone(),
            user_address: self.user_address,
            start_timestamp: self.start_timestamp,
            duration_days: self.duration_days,
        }
    }

    pub fn check(&self, now: u64, contract: &Address) -> EngineResult<()> {
        if !self.is_valid_at(now) {
            return Err(EngineError::AuthorizationInvalid(format!(
                "expired at {}",
                self.expires_at()
            )));
        }
        if !self.covers(contract) {
            return Err(EngineError::AuthorizationInvalid(format!(
                "contract {contract} not covered"
            )));
        }
        Ok(())
    }
}

pub fn normalize_contracts(contracts: &[Address]) -> Vec<Address> {
    let mut out = contracts.to_vec();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Initializing,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine not ready")]
    NotReady,
    #[error("operand {value} outside the supported uint32 range")]
    InvalidOperand { value: u64 },
    #[error("authorization invalid: {0}")]
    AuthorizationInvalid(String),
    #[error("decrypt failed: {0}")]
    DecryptFailed(String),
    #[error("encrypt failed: {0}")]
    EncryptFailed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[async_trait]
pub trait FheEngine: Send + Sync {
    fn engine_id(&self) -> &'static str;
    fn status(&self) -> EngineStatus;
    fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }
    fn generate_keypair(&self) -> EngineResult<DecryptionKeypair>;
    fn authorization_message(&self, request: &AuthorizationRequest) -> Vec<u8> {
        request.signing_bytes()
    }
    async fn encrypt_operand(
        &self,
        contract: Address,
        user: Address,
        value: u64,
    ) -> EngineResult<EncryptedOperand>;
    async fn decrypt(
        &self,
        pair: &HandleContractPair,
        authorization: &DecryptionAuthorization,
    ) -> EngineResult<u32>;
}

/// User-facing description of an engine that is not ready, or `None` when it is.
pub fn describe_engine_status(status: &EngineStatus) -> Option<&'static str> {
    match status {
        EngineStatus::Ready => None,
        EngineStatus::Initializing => Some("FHE engine is starting up, try again shortly."),
        EngineStatus::Failed(reason) if reason.contains("unwrap_throw") || reason.contains("panicked") => {
            Some("FHE engine is recovering, refresh and try again in a moment.")
        }
        EngineStatus::Failed(_) => {
            Some("FHE engine is unavailable, reconnect the wallet or restart the session.")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            max_attempts: 6,
        }
    }
}

/// Polls `engine` with exponential backoff until it reports ready. Gives up with
/// `EngineError::NotReady` after `max_attempts` sleeps.
pub async fn wait_until_ready(engine: &dyn FheEngine, backoff: &BackoffConfig) -> EngineResult<()> {
    let mut delay = backoff.initial_delay_ms.max(1);
    let mut attempt = 0;
    loop {
        match engine.status() {
            EngineStatus::Ready => return Ok(()),
            EngineStatus::Initializing => {
                debug!(engine = engine.engine_id(), attempt, "engine still initializing");
            }
            EngineStatus::Failed(reason) => {
                warn!(engine = engine.engine_id(), attempt, %reason, "engine reported failure");
            }
        }
        if attempt >= backoff.max_attempts {
            return Err(EngineError::NotReady);
        }
        tokio::time::sleep(Duration::from_millis(delay)).await;
        delay = (delay.saturating_mul(2)).min(backoff.max_delay_ms.max(1));
        attempt += 1;
    }
}

pub trait Clock: Send + Sync {
    /// Unix time in seconds.
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
