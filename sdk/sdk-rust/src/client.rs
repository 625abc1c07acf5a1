use crate::config::SdkConfig;
use crate::error::{CounterError, Missing, OperationKind};
use alloy_primitives::{Address, B256};
use authorization::{AuthorizationError, AuthorizationManager, AuthorizationStatus, AuthorizationStore};
use chain::{classify, wait_for_finality, ChainClient, ChainError, CounterContract, FailureClass, Signer};
use engine::{
    describe_engine_status, wait_until_ready, Clock, EngineError, FheEngine, HandleContractPair,
};
use fhe_counter::{CounterCall, Deployment, DeploymentRegistry};
use state::{Binding, CommitOutcome, CounterSnapshot, CounterStore, Notice, Subscription, WriteKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const NETWORK_CHANGED: &str = "Network changed, showing the new counter state.";

#[derive(Default)]
struct Session {
    signer: Option<Arc<dyn Signer>>,
    engine: Option<Arc<dyn FheEngine>>,
    chain: Option<Arc<dyn ChainClient>>,
    chain_id: Option<u64>,
}

struct Context {
    signer: Option<Arc<dyn Signer>>,
    engine: Option<Arc<dyn FheEngine>>,
    chain: Option<Arc<dyn ChainClient>>,
    binding: Binding,
}

struct Ready {
    signer: Arc<dyn Signer>,
    engine: Arc<dyn FheEngine>,
    chain: Arc<dyn ChainClient>,
    deployment: Deployment,
}

impl Context {
    fn require(self) -> Result<Ready, Missing> {
        let signer = self.signer.ok_or(Missing::Signer)?;
        let (deployment, chain) = match (self.binding.deployment, self.chain) {
            (Some(deployment), Some(chain)) => (deployment, chain),
            _ => return Err(Missing::Deployment),
        };
        let engine = self.engine.ok_or(Missing::Engine)?;
        Ok(Ready {
            signer,
            engine,
            chain,
            deployment,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Intent {
    Increment(u64),
    Decrement(u64),
    Reset,
}

impl Intent {
    fn kind(&self) -> WriteKind {
        match self {
            Intent::Increment(_) => WriteKind::Increment,
            Intent::Decrement(_) => WriteKind::Decrement,
            Intent::Reset => WriteKind::Reset,
        }
    }

    fn preparing(&self) -> &'static str {
        match self {
            Intent::Increment(_) => "Preparing encrypted increment...",
            Intent::Decrement(_) => "Preparing encrypted decrement...",
            Intent::Reset => "Resetting counter to zero...",
        }
    }

    fn confirmed(&self) -> &'static str {
        match self {
            Intent::Increment(_) => "Counter incremented. Refreshing state...",
            Intent::Decrement(_) => "Counter decremented. Refreshing state...",
            Intent::Reset => "Counter reset. Refreshing state...",
        }
    }
}

pub struct CounterClient {
    config: SdkConfig,
    registry: DeploymentRegistry,
    store: CounterStore,
    authorizations: AuthorizationManager,
    session: Mutex<Session>,
}

impl CounterClient {
    pub fn new(
        config: SdkConfig,
        registry: DeploymentRegistry,
        authorization_store: Arc<dyn AuthorizationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let authorizations = AuthorizationManager::new(
            authorization_store,
            clock,
            config.authorization_duration_days,
        );
        Self {
            config,
            registry,
            store: CounterStore::new(),
            authorizations,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> Context {
        let session = self.session();
        Context {
            signer: session.signer.clone(),
            engine: session.engine.clone(),
            chain: session.chain.clone(),
            binding: self.store.binding(),
        }
    }

    pub fn connect_signer(&self, signer: Arc<dyn Signer>) {
        info!(user = %signer.address(), "signer connected");
        self.session().signer = Some(signer);
    }

    pub fn disconnect_signer(&self) {
        if self.session().signer.take().is_some() {
            info!("signer disconnected");
        }
    }

    pub fn attach_engine(&self, engine: Arc<dyn FheEngine>) {
        info!(engine = engine.engine_id(), status = ?engine.status(), "engine attached");
        self.session().engine = Some(engine);
    }

    pub fn switch_network(&self, chain_id: u64, chain: Arc<dyn ChainClient>) -> Option<Deployment> {
        let mut session = self.session();
        let deployment = self.registry.resolve(chain_id);
        session.chain = Some(chain);
        session.chain_id = Some(chain_id);
        let binding = self.store.bind_deployment(deployment.clone());
        match &deployment {
            Some(d) => info!(chain_id, contract = %d.contract_address, epoch = binding.epoch, "network bound"),
            None => warn!(chain_id, "no counter deployment on this network"),
        }
        deployment
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.session().chain_id
    }

    pub fn deployment(&self) -> Option<Deployment> {
        self.store.binding().deployment
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    pub fn can_use_contract(&self) -> bool {
        self.context()
            .require()
            .map(|ready| ready.engine.is_ready())
            .unwrap_or(false)
    }

    pub fn engine_status_message(&self) -> Option<&'static str> {
        match &self.session().engine {
            Some(engine) => describe_engine_status(&engine.status()),
            None => Some(Missing::Engine.guidance()),
        }
    }

    pub async fn authorization_status(&self) -> AuthorizationStatus {
        let ctx = self.context();
        match (ctx.signer, ctx.binding.deployment) {
            (Some(signer), Some(deployment)) => {
                self.authorizations
                    .status(&signer.address(), &[deployment.contract_address])
                    .await
            }
            _ => AuthorizationStatus::Unsigned,
        }
    }

    pub async fn increment(&self, value: u64) -> Result<(), CounterError> {
        self.write(Intent::Increment(value)).await
    }

    pub async fn decrement(&self, value: u64) -> Result<(), CounterError> {
        self.write(Intent::Decrement(value)).await
    }

    pub async fn reset(&self) -> Result<(), CounterError> {
        self.write(Intent::Reset).await
    }

    async fn write(&self, intent: Intent) -> Result<(), CounterError> {
        let kind = intent.kind();
        let op = OperationKind::from(kind);
        let ready = self.context().require().map_err(|missing| self.precondition(op, missing))?;
        let Some(_pending) = self.store.try_begin(kind) else {
            debug!(op = %op, "rejected, already in flight");
            return Err(CounterError::AlreadyInFlight(op));
        };

        let id = Uuid::new_v4();
        info!(%id, op = %op, contract = %ready.deployment.contract_address, "starting");
        self.store.set_notice(Notice::info(intent.preparing()));
        if let Err(err) = self.submit(intent, &ready, id).await {
            self.report(op, &err, Some(ready.engine.as_ref()), id);
            return Err(err);
        }

        self.store.set_notice(Notice::info(intent.confirmed()));
        if let Err(err) = self.refresh().await {
            warn!(%id, op = %op, "post-write refresh failed: {err}");
        }
        Ok(())
    }

    async fn submit(&self, intent: Intent, ready: &Ready, id: Uuid) -> Result<(), CounterError> {
        let op = OperationKind::from(intent.kind());
        let contract = CounterContract::new(ready.deployment.contract_address);
        let call = match intent {
            Intent::Increment(value) | Intent::Decrement(value) => {
                wait_until_ready(ready.engine.as_ref(), &self.config.engine_ready)
                    .await
                    .map_err(|_| CounterError::EngineNotReady)?;
                let operand = ready
                    .engine
                    .encrypt_operand(contract.address(), ready.signer.address(), value)
                    .await
                    .map_err(|err| engine_failure(op, err))?;
                debug!(%id, handle = %operand.handle, "operand encrypted");
                match intent {
                    Intent::Increment(_) => CounterCall::Increment {
                        operand: operand.handle,
                        proof: operand.proof,
                    },
                    _ => CounterCall::Decrement {
                        operand: operand.handle,
                        proof: operand.proof,
                    },
                }
            }
            Intent::Reset => CounterCall::Reset,
        };

        let tx = contract
            .submit(ready.signer.as_ref(), &call)
            .await
            .map_err(|err| chain_failure(op, err))?;
        wait_for_finality(ready.chain.as_ref(), tx, &self.config.finality())
            .await
            .map_err(|err| chain_failure(op, err))?;
        info!(%id, op = %op, %tx, "confirmed");
        Ok(())
    }

    /// Re-reads the count handle. With no deployment bound the state is cleared instead.
    pub async fn refresh(&self) -> Result<(), CounterError> {
        let ctx = self.context();
        let (deployment, chain) = match (ctx.binding.deployment, ctx.chain) {
            (Some(deployment), Some(chain)) => (deployment, chain),
            _ => {
                self.store.clear_undeployed();
                return Ok(());
            }
        };

        let refresh = self.store.begin_refresh();
        self.store.set_notice(Notice::info("Refreshing FHE counter state..."));
        let contract = CounterContract::new(deployment.contract_address);
        let handle = match contract.get_count(chain.as_ref()).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(contract = %contract.address(), "refresh failed: {err}");
                if self.store.binding().epoch == ctx.binding.epoch {
                    self.store.set_notice(Notice::error("Failed to refresh counter state."));
                } else {
                    self.store.set_notice(Notice::info(NETWORK_CHANGED));
                }
                return Err(CounterError::failed(OperationKind::Refresh, err));
            }
        };

        match self
            .store
            .commit_refresh(&refresh, ctx.binding.epoch, contract.address(), handle)
        {
            CommitOutcome::Applied { handle_changed } => {
                debug!(%handle, handle_changed, ticket = refresh.ticket(), "refresh committed");
                self.store.set_notice(Notice::info("Counter state refreshed."));
            }
            CommitOutcome::StaleBinding => {
                debug!(epoch = ctx.binding.epoch, "discarding refresh for a previous deployment");
                self.store.set_notice(Notice::info(NETWORK_CHANGED));
            }
            CommitOutcome::Superseded => {
                debug!(ticket = refresh.ticket(), "discarding refresh overtaken by a newer one");
                self.store.set_notice(Notice::info("Counter state refreshed."));
            }
        }
        Ok(())
    }

    /// `Ok(None)` when there is no handle to decrypt.
    pub async fn decrypt_count(&self) -> Result<Option<u32>, CounterError> {
        let op = OperationKind::Decrypt;
        let ctx = self.context();
        let epoch = ctx.binding.epoch;
        let ready = ctx.require().map_err(|missing| self.precondition(op, missing))?;

        let snapshot = self.store.snapshot();
        let handle = match snapshot.state.count_handle {
            Some(handle) if handle != B256::ZERO && snapshot.epoch == epoch => handle,
            _ => {
                self.store.set_notice(Notice::info("No counter value to decrypt."));
                return Ok(None);
            }
        };

        let id = Uuid::new_v4();
        self.store.set_notice(Notice::info("Decrypting counter value..."));
        match self.decrypt_handle(handle, &ready, id).await {
            Ok(value) => {
                if self.store.commit_decrypted(handle, value) {
                    self.store.set_notice(Notice::info("Counter value decrypted locally."));
                } else {
                    debug!(%id, %handle, "handle changed during decrypt, value not stored");
                    self.store
                        .set_notice(Notice::info("Counter value changed, decrypt again."));
                }
                Ok(Some(value))
            }
            Err(err) => {
                self.report(op, &err, Some(ready.engine.as_ref()), id);
                Err(err)
            }
        }
    }

    async fn decrypt_handle(&self, handle: B256, ready: &Ready, id: Uuid) -> Result<u32, CounterError> {
        let op = OperationKind::Decrypt;
        wait_until_ready(ready.engine.as_ref(), &self.config.engine_ready)
            .await
            .map_err(|_| CounterError::EngineNotReady)?;

        let user = ready.signer.address();
        let contracts: [Address; 1] = [ready.deployment.contract_address];
        let authorization = self
            .authorizations
            .load_or_sign(ready.engine.as_ref(), &contracts, ready.signer.as_ref())
            .await
            .map_err(|err| match err {
                AuthorizationError::Rejected => CounterError::AuthorizationRejected,
                AuthorizationError::Engine(EngineError::NotReady) => CounterError::EngineNotReady,
                other => CounterError::failed(op, other),
            })?;

        let pair = HandleContractPair {
            handle,
            contract_address: ready.deployment.contract_address,
        };
        match ready.engine.decrypt(&pair, &authorization).await {
            Ok(value) => {
                info!(%id, %handle, "decrypted");
                Ok(value)
            }
            Err(EngineError::AuthorizationInvalid(reason)) => {
                self.authorizations.invalidate(&user, &contracts).await;
                Err(CounterError::AuthorizationInvalid(reason))
            }
            Err(err) => Err(engine_failure(op, err)),
        }
    }

    fn precondition(&self, op: OperationKind, missing: Missing) -> CounterError {
        info!(op = %op, ?missing, "precondition not met");
        self.store.set_notice(Notice::info(missing.guidance()));
        CounterError::PreconditionNotMet(missing)
    }

    fn report(&self, op: OperationKind, err: &CounterError, engine: Option<&dyn FheEngine>, id: Uuid) {
        let notice = match err {
            CounterError::UserCancelled(_) => {
                info!(%id, op = %op, "cancelled in wallet");
                Notice::info(format!("{op} cancelled in wallet."))
            }
            CounterError::AuthorizationRejected => {
                info!(%id, op = %op, "decryption signature rejected");
                Notice::info("Decryption signature rejected in wallet.")
            }
            CounterError::EngineNotReady => {
                warn!(%id, op = %op, "engine not ready");
                let message = engine
                    .and_then(|engine| describe_engine_status(&engine.status()))
                    .unwrap_or("FHE engine is not ready, try again shortly.");
                Notice::info(message)
            }
            CounterError::AuthorizationInvalid(reason) => {
                warn!(%id, op = %op, %reason, "authorization refused by engine");
                Notice::error("Decryption authorization is no longer valid. Decrypt again to re-sign.")
            }
            CounterError::PreconditionNotMet(missing) => Notice::info(missing.guidance()),
            CounterError::AlreadyInFlight(_) => return,
            CounterError::OperationFailed { reason, .. } => {
                error!(%id, op = %op, %reason, "operation failed");
                match op {
                    OperationKind::Decrypt => Notice::error("Failed to decrypt counter value."),
                    OperationKind::Refresh => Notice::error("Failed to refresh counter state."),
                    _ => Notice::error(format!("{op} failed.")),
                }
            }
        };
        self.store.set_notice(notice);
    }
}

fn chain_failure(op: OperationKind, err: ChainError) -> CounterError {
    match classify(&err) {
        FailureClass::UserCancelled => CounterError::UserCancelled(op),
        FailureClass::Failed => CounterError::failed(op, err),
    }
}

fn engine_failure(op: OperationKind, err: EngineError) -> CounterError {
    match err {
        EngineError::NotReady => CounterError::EngineNotReady,
        EngineError::AuthorizationInvalid(reason) => CounterError::AuthorizationInvalid(reason),
        other => CounterError::failed(op, other),
    }
}
