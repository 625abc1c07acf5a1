use alloy_primitives::{keccak256, Address};
use async_trait::async_trait;
use chain::{classify, ChainError, FailureClass, Signer};
use engine::{
    normalize_contracts, AuthorizationRequest, Clock, DecryptionAuthorization, EngineError,
    FheEngine,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Durable string storage for signed authorizations.
#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuthorizationStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuthorizationStore for InMemoryAuthorizationStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(key);
        Ok(())
    }
}

/// Keeps all entries in one JSON object on disk.
pub struct JsonFileAuthorizationStore {
    path: PathBuf,
    io: tokio::sync::Mutex<()>,
}

impl JsonFileAuthorizationStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            io: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> anyhow::Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthorizationStore for JsonFileAuthorizationStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _io = self.io.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let _io = self.io.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let _io = self.io.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

/// Cache key for `(user, sorted contract set)`.
pub fn cache_key(user: &Address, contracts: &[Address]) -> String {
    let mut packed = Vec::new();
    for contract in normalize_contracts(contracts) {
        packed.extend_from_slice(contract.as_slice());
    }
    format!(
        "fhe-counter/decrypt/{}/{}",
        user.to_string().to_lowercase(),
        keccak256(&packed)
    )
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("decryption signature rejected in wallet")]
    Rejected,
    #[error("signer failed: {0}")]
    Signer(ChainError),
    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),
    #[error("no contract addresses to authorize")]
    NoContracts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Unsigned,
    Pending,
    Valid,
}

#[derive(Default)]
struct SigningRound {
    last_key: Option<String>,
    last_rejected: bool,
}

/// Marks `key` as the one with an open wallet prompt until dropped.
struct InFlight<'a>(&'a Mutex<Option<String>>);

impl<'a> InFlight<'a> {
    fn enter(slot: &'a Mutex<Option<String>>, key: &str) -> Self {
        *lock_slot(slot) = Some(key.to_string());
        Self(slot)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *lock_slot(self.0) = None;
    }
}

fn lock_slot(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Produces and caches decryption authorizations. Only one wallet signing flow runs at
/// a time; callers arriving during a flow wait for it and reuse its outcome.
pub struct AuthorizationManager {
    store: Arc<dyn AuthorizationStore>,
    clock: Arc<dyn Clock>,
    duration_days: u32,
    signing: tokio::sync::Mutex<SigningRound>,
    finished_rounds: AtomicU64,
    signing_key: Mutex<Option<String>>,
}

impl AuthorizationManager {
    pub fn new(store: Arc<dyn AuthorizationStore>, clock: Arc<dyn Clock>, duration_days: u32) -> Self {
        Self {
            store,
            clock,
            duration_days,
            signing: tokio::sync::Mutex::new(SigningRound::default()),
            finished_rounds: AtomicU64::new(0),
            signing_key: Mutex::new(None),
        }
    }

    pub fn duration_days(&self) -> u32 {
        self.duration_days
    }

    pub async fn load_or_sign(
        &self,
        engine: &dyn FheEngine,
        contracts: &[Address],
        signer: &dyn Signer,
    ) -> Result<DecryptionAuthorization, AuthorizationError> {
        let contracts = normalize_contracts(contracts);
        if contracts.is_empty() {
            return Err(AuthorizationError::NoContracts);
        }
        let user = signer.address();
        let key = cache_key(&user, &contracts);
        if let Some(auth) = self.load_valid(&key, &user, &contracts).await {
            return Ok(auth);
        }

        let ticket = self.finished_rounds.load(Ordering::SeqCst);
        let mut round = self.signing.lock().await;
        // a flow may have stored this key between the first lookup and the lock
        if let Some(auth) = self.load_valid(&key, &user, &contracts).await {
            return Ok(auth);
        }
        if self.finished_rounds.load(Ordering::SeqCst) != ticket
            && round.last_rejected
            && round.last_key.as_deref() == Some(key.as_str())
        {
            debug!(%user, "sharing rejection of the signing flow we waited on");
            return Err(AuthorizationError::Rejected);
        }

        let outcome = {
            let _pending = InFlight::enter(&self.signing_key, &key);
            self.sign(engine, &contracts, signer, &key).await
        };
        round.last_key = Some(key);
        round.last_rejected = matches!(outcome, Err(AuthorizationError::Rejected));
        self.finished_rounds.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    pub async fn status(&self, user: &Address, contracts: &[Address]) -> AuthorizationStatus {
        let contracts = normalize_contracts(contracts);
        let key = cache_key(user, &contracts);
        if lock_slot(&self.signing_key).as_deref() == Some(key.as_str()) {
            return AuthorizationStatus::Pending;
        }
        match self.load_valid(&key, user, &contracts).await {
            Some(_) => AuthorizationStatus::Valid,
            None => AuthorizationStatus::Unsigned,
        }
    }

    pub async fn invalidate(&self, user: &Address, contracts: &[Address]) {
        let key = cache_key(user, contracts);
        if let Err(err) = self.store.remove(&key).await {
            warn!(%user, "failed to drop cached authorization: {err:#}");
        } else {
            info!(%user, "cached authorization dropped");
        }
    }

    async fn load_valid(
        &self,
        key: &str,
        user: &Address,
        contracts: &[Address],
    ) -> Option<DecryptionAuthorization> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(%user, "authorization cache read failed: {err:#}");
                return None;
            }
        };
        let auth: DecryptionAuthorization = match serde_json::from_str(&raw) {
            Ok(auth) => auth,
            Err(err) => {
                warn!(%user, "discarding unreadable cached authorization: {err}");
                return None;
            }
        };
        let now = self.clock.now();
        if auth.user_address != *user || !contracts.iter().all(|c| auth.covers(c)) {
            debug!(%user, "cached authorization does not match request");
            return None;
        }
        if !auth.is_valid_at(now) {
            debug!(%user, expired_at = auth.expires_at(), now, "cached authorization expired");
            return None;
        }
        Some(auth)
    }

    async fn sign(
        &self,
        engine: &dyn FheEngine,
        contracts: &[Address],
        signer: &dyn Signer,
        key: &str,
    ) -> Result<DecryptionAuthorization, AuthorizationError> {
        let user = signer.address();
        let keypair = engine.generate_keypair()?;
        let start = self.clock.now();
        let request = AuthorizationRequest::new(
            keypair.public_key.clone(),
            contracts,
            user,
            start,
            self.duration_days,
        );
        let message = engine.authorization_message(&request);
        info!(%user, contracts = contracts.len(), "requesting decryption signature");
        let signature = signer.sign_message(&message).await.map_err(|err| match classify(&err) {
            FailureClass::UserCancelled => AuthorizationError::Rejected,
            FailureClass::Failed => AuthorizationError::Signer(err),
        })?;

        let auth = DecryptionAuthorization {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature,
            contract_addresses: request.contract_addresses,
            user_address: user,
            start_timestamp: start,
            duration_days: self.duration_days,
        };
        match serde_json::to_string(&auth) {
            Ok(json) => {
                if let Err(err) = self.store.set(key, json).await {
                    warn!(%user, "failed to persist authorization: {err:#}");
                }
            }
            Err(err) => warn!(%user, "failed to serialize authorization: {err}"),
        }
        info!(%user, expires_at = auth.expires_at(), "decryption authorization ready");
        Ok(auth)
    }
}
