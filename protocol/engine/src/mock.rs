//! In-process engine for local development chains.
//!
//! The [`Coprocessor`] stands in for the off-chain FHE co-processor: it keeps the
//! plaintext behind every handle, tracks which accounts may decrypt which handle,
//! and issues deterministic input proofs. [`MockEngine`] is the client-side view of it.

use crate::{
    AuthorizationRequest, Clock, DecryptionAuthorization, DecryptionKeypair, EncryptedOperand,
    EngineError, EngineResult, EngineStatus, FheEngine, Handle, HandleContractPair,
};
use alloy_primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Default)]
struct CoprocessorState {
    plaintexts: HashMap<Handle, u32>,
    acl: HashMap<Handle, HashSet<Address>>,
    sequence: u64,
}

impl CoprocessorState {
    fn mint(&mut self, value: u32) -> Handle {
        self.sequence += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fhe-counter/handle");
        hasher.update(&self.sequence.to_be_bytes());
        let handle = B256::from(*hasher.finalize().as_bytes());
        self.plaintexts.insert(handle, value);
        handle
    }

    // The zero handle is an uninitialised ciphertext and reads as 0.
    fn value_of(&self, handle: &Handle) -> Option<u32> {
        if *handle == B256::ZERO {
            return Some(0);
        }
        self.plaintexts.get(handle).copied()
    }
}

#[derive(Clone, Default)]
pub struct Coprocessor {
    inner: Arc<Mutex<CoprocessorState>>,
}

impl Coprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CoprocessorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn input(&self, contract: Address, user: Address, value: u32) -> EncryptedOperand {
        let handle = self.lock().mint(value);
        EncryptedOperand {
            handle,
            proof: input_proof(&handle, &contract, &user),
        }
    }

    pub fn verify_input(&self, operand: &EncryptedOperand, contract: Address, user: Address) -> bool {
        self.lock().plaintexts.contains_key(&operand.handle)
            && operand.proof == input_proof(&operand.handle, &contract, &user)
    }

    pub fn trivial(&self, value: u32) -> Handle {
        self.lock().mint(value)
    }

    pub fn add(&self, lhs: &Handle, rhs: &Handle) -> Option<Handle> {
        let mut state = self.lock();
        let value = state.value_of(lhs)?.wrapping_add(state.value_of(rhs)?);
        Some(state.mint(value))
    }

    pub fn sub(&self, lhs: &Handle, rhs: &Handle) -> Option<Handle> {
        let mut state = self.lock();
        let value = state.value_of(lhs)?.wrapping_sub(state.value_of(rhs)?);
        Some(state.mint(value))
    }

    pub fn allow(&self, handle: Handle, account: Address) {
        self.lock().acl.entry(handle).or_default().insert(account);
    }

    pub fn is_allowed(&self, handle: &Handle, account: &Address) -> bool {
        self.lock()
            .acl
            .get(handle)
            .map(|allowed| allowed.contains(account))
            .unwrap_or(false)
    }

    pub fn plaintext(&self, handle: &Handle) -> Option<u32> {
        self.lock().value_of(handle)
    }
}

fn input_proof(handle: &Handle, contract: &Address, user: &Address) -> Bytes {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"fhe-counter/input-proof");
    hasher.update(handle.as_slice());
    hasher.update(contract.as_slice());
    hasher.update(user.as_slice());
    Bytes::from(hasher.finalize().as_bytes().to_vec())
}

fn derive_public_key(private_key: &[u8]) -> Bytes {
    Bytes::from(blake3::hash(private_key).as_bytes().to_vec())
}

pub fn address_from_pubkey(pubkey: &[u8]) -> Address {
    Address::from_slice(&keccak256(pubkey)[12..])
}

/// Devnet wallets sign as `verifying_key (32) || ed25519 signature (64)`.
pub fn sign_devnet_message(key: &SigningKey, message: &[u8]) -> Bytes {
    let mut out = key.verifying_key().to_bytes().to_vec();
    out.extend_from_slice(&key.sign(message).to_bytes());
    Bytes::from(out)
}

pub fn verify_devnet_signature(message: &[u8], signature: &[u8], signer: &Address) -> bool {
    if signature.len() != 96 {
        return false;
    }
    let mut pk = [0u8; 32];
    pk.copy_from_slice(&signature[..32]);
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&signature[32..]) else {
        return false;
    };
    address_from_pubkey(&pk) == *signer && verifying_key.verify(message, &sig).is_ok()
}

pub struct MockEngine {
    coprocessor: Coprocessor,
    clock: Arc<dyn Clock>,
    status: Mutex<EngineStatus>,
}

impl MockEngine {
    pub fn new(coprocessor: Coprocessor, clock: Arc<dyn Clock>) -> Self {
        Self {
            coprocessor,
            clock,
            status: Mutex::new(EngineStatus::Ready),
        }
    }

    pub fn initializing(coprocessor: Coprocessor, clock: Arc<dyn Clock>) -> Self {
        let engine = Self::new(coprocessor, clock);
        engine.set_status(EngineStatus::Initializing);
        engine
    }

    pub fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn mark_ready(&self) {
        self.set_status(EngineStatus::Ready);
    }

    pub fn coprocessor(&self) -> &Coprocessor {
        &self.coprocessor
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }
}

#[async_trait]
impl FheEngine for MockEngine {
    fn engine_id(&self) -> &'static str {
        "mock"
    }

    fn status(&self) -> EngineStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn generate_keypair(&self) -> EngineResult<DecryptionKeypair> {
        let mut private_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key);
        Ok(DecryptionKeypair {
            public_key: derive_public_key(&private_key),
            private_key: Bytes::from(private_key.to_vec()),
        })
    }

    async fn encrypt_operand(
        &self,
        contract: Address,
        user: Address,
        value: u64,
    ) -> EngineResult<EncryptedOperand> {
        self.ensure_ready()?;
        let value = u32::try_from(value).map_err(|_| EngineError::InvalidOperand { value })?;
        let operand = self.coprocessor.input(contract, user, value);
        debug!(%contract, %user, handle = %operand.handle, "encrypted operand");
        Ok(operand)
    }

    async fn decrypt(
        &self,
        pair: &HandleContractPair,
        authorization: &DecryptionAuthorization,
    ) -> EngineResult<u32> {
        self.ensure_ready()?;
        authorization.check(self.clock.now(), &pair.contract_address)?;
        if derive_public_key(&authorization.private_key) != authorization.public_key {
            return Err(EngineError::AuthorizationInvalid(
                "keypair does not match".into(),
            ));
        }
        let request: AuthorizationRequest = authorization.request();
        let message = self.authorization_message(&request);
        if !verify_devnet_signature(&message, &authorization.signature, &authorization.user_address) {
            return Err(EngineError::AuthorizationInvalid(
                "signature does not match user".into(),
            ));
        }
        if !self.coprocessor.is_allowed(&pair.handle, &authorization.user_address) {
            return Err(EngineError::DecryptFailed(format!(
                "{} may not decrypt {}",
                authorization.user_address, pair.handle
            )));
        }
        self.coprocessor
            .plaintext(&pair.handle)
            .ok_or_else(|| EngineError::DecryptFailed(format!("unknown handle {}", pair.handle)))
    }
}
