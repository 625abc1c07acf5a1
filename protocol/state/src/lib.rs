use alloy_primitives::Address;
use engine::Handle;
use fhe_counter::Deployment;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterState {
    pub contract_address: Option<Address>,
    pub is_deployed: bool,
    pub count_handle: Option<Handle>,
}

/// Plaintext together with the handle it was decrypted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecryptedValue {
    pub handle: Handle,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WriteKind {
    Increment,
    Decrement,
    Reset,
}

impl WriteKind {
    pub fn label(&self) -> &'static str {
        match self {
            WriteKind::Increment => "Increment",
            WriteKind::Decrement => "Decrement",
            WriteKind::Reset => "Reset",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingOperations {
    pub refreshing: bool,
    pub incrementing: bool,
    pub decrementing: bool,
    pub resetting: bool,
}

impl PendingOperations {
    pub fn is_pending(&self, kind: WriteKind) -> bool {
        match kind {
            WriteKind::Increment => self.incrementing,
            WriteKind::Decrement => self.decrementing,
            WriteKind::Reset => self.resetting,
        }
    }

    fn set(&mut self, kind: WriteKind, pending: bool) {
        match kind {
            WriteKind::Increment => self.incrementing = pending,
            WriteKind::Decrement => self.decrementing = pending,
            WriteKind::Reset => self.resetting = pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterSnapshot {
    pub epoch: u64,
    pub deployment: Option<Deployment>,
    pub state: CounterState,
    pub decrypted: Option<DecryptedValue>,
    pub pending: PendingOperations,
    pub notice: Option<Notice>,
}

impl CounterSnapshot {
    /// The decrypted count, if it belongs to the handle currently held.
    pub fn decrypted_count(&self) -> Option<u32> {
        self.decrypted
            .filter(|d| self.state.count_handle == Some(d.handle))
            .map(|d| d.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub epoch: u64,
    pub deployment: Option<Deployment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { handle_changed: bool },
    /// The deployment binding changed while the read was in flight.
    StaleBinding,
    /// A refresh started later has already committed.
    Superseded,
}

#[derive(Default)]
struct StoreInner {
    snapshot: CounterSnapshot,
    refreshes_in_flight: u32,
    next_refresh_ticket: u64,
    last_committed_ticket: u64,
}

struct Shared {
    inner: Mutex<StoreInner>,
    publisher: broadcast::Sender<CounterSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition<R>(&self, apply: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.lock();
        let out = apply(&mut inner);
        // no subscribers is fine
        let _ = self.publisher.send(inner.snapshot.clone());
        out
    }
}

#[derive(Clone)]
pub struct CounterStore {
    shared: Arc<Shared>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    pub fn new() -> Self {
        let (publisher, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(StoreInner::default()),
                publisher,
            }),
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.shared.lock().snapshot.clone()
    }

    pub fn binding(&self) -> Binding {
        let inner = self.shared.lock();
        Binding {
            epoch: inner.snapshot.epoch,
            deployment: inner.snapshot.deployment.clone(),
        }
    }

    pub fn bind_deployment(&self, deployment: Option<Deployment>) -> Binding {
        self.shared.transition(|inner| {
            let snap = &mut inner.snapshot;
            if snap.deployment != deployment {
                snap.epoch += 1;
                snap.deployment = deployment;
                snap.state = CounterState::default();
                snap.decrypted = None;
                debug!(epoch = snap.epoch, "deployment binding changed");
            }
            Binding {
                epoch: snap.epoch,
                deployment: snap.deployment.clone(),
            }
        })
    }

    pub fn clear_undeployed(&self) {
        self.shared.transition(|inner| {
            inner.snapshot.state = CounterState::default();
            inner.snapshot.decrypted = None;
        });
    }

    pub fn begin_refresh(&self) -> RefreshGuard {
        let ticket = self.shared.transition(|inner| {
            inner.next_refresh_ticket += 1;
            inner.refreshes_in_flight += 1;
            inner.snapshot.pending.refreshing = true;
            inner.next_refresh_ticket
        });
        RefreshGuard {
            shared: self.shared.clone(),
            ticket,
        }
    }

    pub fn commit_refresh(
        &self,
        guard: &RefreshGuard,
        epoch: u64,
        contract: Address,
        handle: Handle,
    ) -> CommitOutcome {
        self.shared.transition(|inner| {
            if inner.snapshot.epoch != epoch {
                return CommitOutcome::StaleBinding;
            }
            if guard.ticket < inner.last_committed_ticket {
                return CommitOutcome::Superseded;
            }
            inner.last_committed_ticket = guard.ticket;
            let snap = &mut inner.snapshot;
            let handle_changed = snap.state.count_handle != Some(handle);
            snap.state = CounterState {
                contract_address: Some(contract),
                is_deployed: true,
                count_handle: Some(handle),
            };
            if handle_changed {
                snap.decrypted = None;
            }
            CommitOutcome::Applied { handle_changed }
        })
    }

    pub fn commit_decrypted(&self, handle: Handle, value: u32) -> bool {
        self.shared.transition(|inner| {
            let snap = &mut inner.snapshot;
            if snap.state.count_handle != Some(handle) {
                return false;
            }
            snap.decrypted = Some(DecryptedValue { handle, value });
            true
        })
    }

    pub fn try_begin(&self, kind: WriteKind) -> Option<WriteGuard> {
        let claimed = self.shared.transition(|inner| {
            if inner.snapshot.pending.is_pending(kind) {
                return false;
            }
            inner.snapshot.pending.set(kind, true);
            true
        });
        claimed.then(|| WriteGuard {
            shared: self.shared.clone(),
            kind,
        })
    }

    pub fn set_notice(&self, notice: Notice) {
        self.shared.transition(|inner| inner.snapshot.notice = Some(notice));
    }

    pub fn subscribe(&self) -> Subscription {
        let inner = self.shared.lock();
        Subscription {
            current: inner.snapshot.clone(),
            receiver: self.shared.publisher.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.publisher.receiver_count()
    }
}

pub struct WriteGuard {
    shared: Arc<Shared>,
    kind: WriteKind,
}

impl WriteGuard {
    pub fn kind(&self) -> WriteKind {
        self.kind
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let kind = self.kind;
        self.shared
            .transition(|inner| inner.snapshot.pending.set(kind, false));
    }
}

pub struct RefreshGuard {
    shared: Arc<Shared>,
    ticket: u64,
}

impl RefreshGuard {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.shared.transition(|inner| {
            inner.refreshes_in_flight = inner.refreshes_in_flight.saturating_sub(1);
            inner.snapshot.pending.refreshing = inner.refreshes_in_flight > 0;
        });
    }
}

/// Live view of the store. Dropping it unsubscribes.
pub struct Subscription {
    current: CounterSnapshot,
    receiver: broadcast::Receiver<CounterSnapshot>,
}

impl Subscription {
    pub fn current(&self) -> CounterSnapshot {
        self.current.clone()
    }

    /// Next transition in order; `None` once the store is gone and the queue is drained.
    pub async fn changed(&mut self) -> Option<CounterSnapshot> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(self.advance(snapshot)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber fell behind, transitions dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_changed(&mut self) -> Option<CounterSnapshot> {
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(self.advance(snapshot)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber fell behind, transitions dropped");
                }
                Err(_) => return None,
            }
        }
    }

    fn advance(&mut self, snapshot: CounterSnapshot) -> CounterSnapshot {
        self.current = snapshot.clone();
        snapshot
    }
}
