use alloy_primitives::{Address, B256};
use fhe_counter_sdk::chain::{CounterContract, Devnet, DevnetSigner};
use fhe_counter_sdk::engine::{BackoffConfig, Coprocessor, ManualClock, MockEngine, SECONDS_PER_DAY};
use fhe_counter_sdk::fhe_counter::CounterCall;
use fhe_counter_sdk::{
    AuthorizationStatus, CounterClient, CounterError, CounterSnapshot, DeploymentRegistry,
    InMemoryAuthorizationStore, Missing, NoticeLevel, OperationKind, SdkConfig, Subscription,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_700_000_000;
const OTHER_CHAIN: u64 = 11155111;

struct Harness {
    client: CounterClient,
    devnet: Devnet,
    signer: Arc<DevnetSigner>,
    engine: Arc<MockEngine>,
    clock: ManualClock,
    engine_clock: ManualClock,
    auth_store: InMemoryAuthorizationStore,
    contract: Address,
    other_devnet: Devnet,
}

fn test_config(duration_days: u32) -> SdkConfig {
    SdkConfig {
        authorization_duration_days: duration_days,
        receipt_poll_interval_ms: 5,
        receipt_timeout_secs: Some(5),
        engine_ready: BackoffConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: 3,
        },
        registry_path: None,
    }
}

fn harness_with(duration_days: u32, engine_ready: bool) -> Harness {
    let coprocessor = Coprocessor::new();
    let devnet = Devnet::new(31337, coprocessor.clone());
    let contract = devnet.deploy_counter();
    let other_devnet = Devnet::new(OTHER_CHAIN, coprocessor.clone());
    let other_contract = other_devnet.deploy_counter();

    let mut registry = DeploymentRegistry::new();
    registry.register(31337, contract, "hardhat");
    registry.register(OTHER_CHAIN, other_contract, "sepolia");

    let clock = ManualClock::new(START);
    let engine_clock = ManualClock::new(START);
    let auth_store = InMemoryAuthorizationStore::new();
    let client = CounterClient::new(
        test_config(duration_days),
        registry,
        Arc::new(auth_store.clone()),
        Arc::new(clock.clone()),
    );

    let engine = if engine_ready {
        MockEngine::new(coprocessor, Arc::new(engine_clock.clone()))
    } else {
        MockEngine::initializing(coprocessor, Arc::new(engine_clock.clone()))
    };
    let engine = Arc::new(engine);
    let signer = Arc::new(DevnetSigner::new(devnet.clone(), [3u8; 32]));

    client.connect_signer(signer.clone());
    client.attach_engine(engine.clone());
    client.switch_network(31337, Arc::new(devnet.clone()));

    Harness {
        client,
        devnet,
        signer,
        engine,
        clock,
        engine_clock,
        auth_store,
        contract,
        other_devnet,
    }
}

fn harness() -> Harness {
    harness_with(365, true)
}

fn notice_text(h: &Harness) -> String {
    h.client.snapshot().notice.map(|n| n.text).unwrap_or_default()
}

fn drain(sub: &mut Subscription) -> Vec<CounterSnapshot> {
    std::iter::from_fn(|| sub.try_changed()).collect()
}

fn notices(seen: &[CounterSnapshot]) -> Vec<String> {
    let mut texts: Vec<String> = Vec::new();
    for text in seen.iter().filter_map(|s| s.notice.as_ref()).map(|n| n.text.clone()) {
        if texts.last() != Some(&text) {
            texts.push(text);
        }
    }
    texts
}

#[test]
fn registry_resolves_known_chain_only() {
    let h = harness();
    let deployment = h.client.registry().resolve(31337).unwrap();
    assert_eq!(deployment.contract_address, h.contract);
    assert!(h.client.registry().resolve(1).is_none());
}

#[tokio::test]
async fn unknown_chain_blocks_every_write() {
    let h = harness();
    assert!(h.client.switch_network(1, Arc::new(Devnet::new(1, Coprocessor::new()))).is_none());
    assert!(!h.client.can_use_contract());

    let missing = CounterError::PreconditionNotMet(Missing::Deployment);
    assert_eq!(h.client.increment(1).await.unwrap_err(), missing);
    assert_eq!(h.client.decrement(1).await.unwrap_err(), missing);
    assert_eq!(h.client.reset().await.unwrap_err(), missing);
    assert_eq!(h.client.decrypt_count().await.unwrap_err(), missing);
    assert_eq!(notice_text(&h), "Contract not deployed on this network.");
    assert_eq!(h.signer.transaction_prompts(), 0);

    h.client.refresh().await.unwrap();
    let snap = h.client.snapshot();
    assert!(!snap.state.is_deployed);
    assert_eq!(snap.state.count_handle, None);
}

#[tokio::test]
async fn disconnected_signer_is_read_only() {
    let h = harness();
    h.client.disconnect_signer();
    assert_eq!(
        h.client.increment(1).await.unwrap_err(),
        CounterError::PreconditionNotMet(Missing::Signer)
    );
    assert_eq!(notice_text(&h), "Connect wallet to continue.");
    h.client.refresh().await.unwrap();
    assert!(h.client.snapshot().state.is_deployed);
}

#[tokio::test]
async fn increment_then_refresh_changes_handle() {
    let h = harness();
    h.client.refresh().await.unwrap();
    let before = h.client.snapshot().state.count_handle;
    assert_eq!(before, Some(B256::ZERO));

    h.client.increment(5).await.unwrap();
    h.client.refresh().await.unwrap();
    let snap = h.client.snapshot();
    assert_ne!(snap.state.count_handle, before);
    assert_eq!(snap.state.contract_address, Some(h.contract));
    assert!(!snap.pending.incrementing);
    assert_eq!(notice_text(&h), "Counter state refreshed.");
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(5));
}

#[tokio::test]
async fn handle_change_clears_decrypted_value() {
    let h = harness();
    h.client.increment(5).await.unwrap();
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(5));
    assert_eq!(h.client.snapshot().decrypted_count(), Some(5));

    h.client.decrement(2).await.unwrap();
    let snap = h.client.snapshot();
    assert_eq!(snap.decrypted, None);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(3));
}

#[tokio::test]
async fn reset_brings_count_back_to_zero() {
    let h = harness();
    h.client.increment(4).await.unwrap();
    let mut sub = h.client.subscribe();
    h.client.reset().await.unwrap();
    assert_eq!(
        notices(&drain(&mut sub)),
        [
            "Counter state refreshed.",
            "Resetting counter to zero...",
            "Counter reset. Refreshing state...",
            "Refreshing FHE counter state...",
            "Counter state refreshed.",
        ]
    );
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(0));
}

#[tokio::test]
async fn nothing_to_decrypt_before_first_write() {
    let h = harness();
    h.client.refresh().await.unwrap();
    assert_eq!(h.client.decrypt_count().await.unwrap(), None);
    assert_eq!(notice_text(&h), "No counter value to decrypt.");
    assert_eq!(h.signer.signature_prompts(), 0);
}

#[tokio::test]
async fn two_decrypts_sign_once() {
    let h = harness();
    h.client.increment(7).await.unwrap();
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(7));
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(7));
    assert_eq!(h.signer.signature_prompts(), 1);
    assert_eq!(h.auth_store.len(), 1);
    assert_eq!(h.client.authorization_status().await, AuthorizationStatus::Valid);
}

#[tokio::test]
async fn concurrent_decrypts_share_one_prompt() {
    let h = harness();
    h.client.increment(2).await.unwrap();
    h.signer.set_prompt_delay(Duration::from_millis(40));
    let (a, b) = tokio::join!(h.client.decrypt_count(), h.client.decrypt_count());
    assert_eq!(a.unwrap(), Some(2));
    assert_eq!(b.unwrap(), Some(2));
    assert_eq!(h.signer.signature_prompts(), 1);
}

#[tokio::test]
async fn expired_authorization_triggers_fresh_signature() {
    let h = harness_with(1, true);
    h.client.increment(1).await.unwrap();
    h.client.decrypt_count().await.unwrap();

    h.clock.advance(SECONDS_PER_DAY);
    h.engine_clock.advance(SECONDS_PER_DAY);
    assert_eq!(h.client.authorization_status().await, AuthorizationStatus::Unsigned);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(1));
    assert_eq!(h.signer.signature_prompts(), 2);
}

#[tokio::test]
async fn authorization_refused_by_engine_is_resigned_next_time() {
    let h = harness_with(30, true);
    h.client.increment(3).await.unwrap();
    h.client.decrypt_count().await.unwrap();

    // The engine sees time past the window while the cache still holds the entry.
    h.engine_clock.advance(31 * SECONDS_PER_DAY);
    let err = h.client.decrypt_count().await.unwrap_err();
    assert!(matches!(err, CounterError::AuthorizationInvalid(_)));
    let notice = h.client.snapshot().notice.unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(h.auth_store.len(), 0);
    assert_eq!(h.signer.signature_prompts(), 1);

    h.engine_clock.set(START);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(3));
    assert_eq!(h.signer.signature_prompts(), 2);
}

#[tokio::test]
async fn rejected_decrypt_signature_stores_nothing() {
    let h = harness();
    h.client.increment(3).await.unwrap();
    h.signer.reject_signatures(true);
    assert_eq!(
        h.client.decrypt_count().await.unwrap_err(),
        CounterError::AuthorizationRejected
    );
    let snap = h.client.snapshot();
    assert_eq!(snap.decrypted, None);
    assert_eq!(snap.notice.unwrap().level, NoticeLevel::Info);
    assert!(h.auth_store.is_empty());
}

#[tokio::test]
async fn second_increment_while_pending_is_rejected() {
    let h = harness();
    h.devnet.hold_finality();
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.client.snapshot().pending.incrementing);
        let outcome = h.client.increment(2).await;
        h.devnet.release_finality();
        outcome
    };
    let (first, second) = tokio::join!(h.client.increment(1), second);

    first.unwrap();
    assert_eq!(
        second.unwrap_err(),
        CounterError::AlreadyInFlight(OperationKind::Increment)
    );
    assert_eq!(h.signer.transaction_prompts(), 1);
    assert!(!h.client.snapshot().pending.incrementing);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(1));
}

#[tokio::test]
async fn different_kinds_may_overlap() {
    let h = harness();
    h.devnet.hold_finality();
    let release = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = h.client.snapshot().pending;
        h.devnet.release_finality();
        pending
    };
    let (inc, dec, pending) = tokio::join!(h.client.increment(5), h.client.decrement(2), release);
    inc.unwrap();
    dec.unwrap();
    assert!(pending.incrementing && pending.decrementing);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(3));
}

#[tokio::test]
async fn wallet_rejection_is_a_cancellation() {
    let h = harness();
    h.client.refresh().await.unwrap();
    let before = h.client.snapshot().state;
    h.signer.reject_transactions(true);

    let err = h.client.increment(5).await.unwrap_err();
    assert_eq!(err, CounterError::UserCancelled(OperationKind::Increment));
    let snap = h.client.snapshot();
    let notice = snap.notice.unwrap();
    assert_eq!(notice.level, NoticeLevel::Info);
    assert_eq!(notice.text, "Increment cancelled in wallet.");
    assert_eq!(snap.state, before);
    assert!(!snap.pending.incrementing);
}

#[tokio::test]
async fn failed_write_reports_error_and_keeps_state() {
    let h = harness();
    // The other network's contract does not exist on this devnet, so the write fails.
    h.client.switch_network(OTHER_CHAIN, Arc::new(h.devnet.clone()));
    let before = h.client.snapshot().state;

    let err = h.client.increment(1).await.unwrap_err();
    assert!(matches!(
        err,
        CounterError::OperationFailed { kind: OperationKind::Increment, .. }
    ));
    let snap = h.client.snapshot();
    let notice = snap.notice.unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(notice.text, "Increment failed.");
    assert_eq!(snap.state, before);
    assert!(!snap.pending.incrementing);
}

#[tokio::test]
async fn refresh_from_previous_network_is_discarded() {
    let h = harness();
    h.client.increment(6).await.unwrap();
    h.devnet.set_read_delay(Duration::from_millis(50));

    let switch = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.client
            .switch_network(OTHER_CHAIN, Arc::new(h.other_devnet.clone()))
    };
    let (refreshed, switched) = tokio::join!(h.client.refresh(), switch);
    refreshed.unwrap();
    let deployment = switched.unwrap();

    let snap = h.client.snapshot();
    assert_eq!(snap.deployment.as_ref(), Some(&deployment));
    assert_eq!(snap.state.count_handle, None);
    assert!(!snap.state.is_deployed);
    assert!(!snap.pending.refreshing);
    assert_eq!(notice_text(&h), "Network changed, showing the new counter state.");

    h.client.refresh().await.unwrap();
    let snap = h.client.snapshot();
    assert_eq!(snap.state.contract_address, Some(deployment.contract_address));
    assert_eq!(snap.state.count_handle, Some(B256::ZERO));
}

#[tokio::test]
async fn engine_that_never_starts_is_not_ready() {
    let h = harness_with(365, false);
    assert_eq!(h.client.increment(1).await.unwrap_err(), CounterError::EngineNotReady);
    assert_eq!(h.signer.transaction_prompts(), 0);
    assert!(!h.client.snapshot().pending.incrementing);
    assert!(h.client.engine_status_message().is_some());
}

#[tokio::test]
async fn engine_becoming_ready_during_backoff_is_used() {
    let h = harness_with(365, false);
    let engine = h.engine.clone();
    let ready = async move {
        tokio::time::sleep(Duration::from_millis(8)).await;
        engine.mark_ready();
    };
    let (outcome, ()) = tokio::join!(h.client.increment(9), ready);
    outcome.unwrap();
    assert!(h.client.can_use_contract());
    assert_eq!(h.client.engine_status_message(), None);
    assert_eq!(h.client.decrypt_count().await.unwrap(), Some(9));
}

#[tokio::test]
async fn subscribers_observe_every_transition() {
    let h = harness();
    let mut sub = h.client.subscribe();
    h.client.increment(4).await.unwrap();
    h.client.decrypt_count().await.unwrap();

    let seen = drain(&mut sub);
    assert!(seen.iter().any(|s| s.pending.incrementing));
    assert!(seen.iter().any(|s| s.pending.refreshing));
    assert_eq!(
        notices(&seen),
        [
            "Preparing encrypted increment...",
            "Counter incremented. Refreshing state...",
            "Refreshing FHE counter state...",
            "Counter state refreshed.",
            "Decrypting counter value...",
            "Counter value decrypted locally.",
        ]
    );
    let last = seen.last().unwrap();
    assert_eq!(last.decrypted_count(), Some(4));
    assert_eq!(last.state.count_handle, h.devnet.count_of(&h.contract));
    assert_eq!(sub.current().decrypted_count(), Some(4));

    drop(sub);
    let mut late = h.client.subscribe();
    assert_eq!(late.current().decrypted_count(), Some(4));
    assert!(late.try_changed().is_none());
}

#[tokio::test]
async fn decrypt_of_replaced_handle_is_not_stored() {
    let h = harness();
    h.client.increment(4).await.unwrap();
    h.signer.set_prompt_delay(Duration::from_millis(40));

    let other = DevnetSigner::new(h.devnet.clone(), [9u8; 32]);
    let replace = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        CounterContract::new(h.contract)
            .submit(&other, &CounterCall::Reset)
            .await
            .unwrap();
        h.client.refresh().await.unwrap();
    };
    let (decrypted, ()) = tokio::join!(h.client.decrypt_count(), replace);
    assert_eq!(decrypted.unwrap(), Some(4));

    let snap = h.client.snapshot();
    assert_eq!(snap.decrypted, None);
    assert_eq!(snap.decrypted_count(), None);
    assert_eq!(notice_text(&h), "Counter value changed, decrypt again.");
}

proptest! {
    #[test]
    fn unregistered_chains_reject_writes(chain_id in any::<u64>()) {
        prop_assume!(chain_id != 31337 && chain_id != OTHER_CHAIN);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let h = harness();
            prop_assert!(h
                .client
                .switch_network(chain_id, Arc::new(Devnet::new(chain_id, Coprocessor::new())))
                .is_none());
            prop_assert_eq!(
                h.client.increment(1).await.unwrap_err(),
                CounterError::PreconditionNotMet(Missing::Deployment)
            );
            prop_assert_eq!(
                h.client.reset().await.unwrap_err(),
                CounterError::PreconditionNotMet(Missing::Deployment)
            );
            prop_assert_eq!(h.signer.transaction_prompts(), 0);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
