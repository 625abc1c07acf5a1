//! Single-process development chain running the counter contract against the mock
//! coprocessor. Blocks are produced one per transaction.

use crate::{CallRequest, ChainClient, ChainError, ErrorCode, Receipt, Signer, TransactionRequest, TxHash};
use alloy_primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use engine::mock::{address_from_pubkey, sign_devnet_message};
use engine::{Coprocessor, EncryptedOperand, Handle};
use fhe_counter::{encode_count, is_get_count, CounterCall};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Default)]
struct DevnetState {
    counters: HashMap<Address, Handle>,
    receipts: HashMap<TxHash, Receipt>,
    block_number: u64,
    deployments: u64,
}

#[derive(Clone)]
pub struct Devnet {
    chain_id: u64,
    coprocessor: Coprocessor,
    state: Arc<Mutex<DevnetState>>,
    finality_held: Arc<AtomicBool>,
    read_delay_ms: Arc<AtomicU64>,
}

impl Devnet {
    pub fn new(chain_id: u64, coprocessor: Coprocessor) -> Self {
        Self {
            chain_id,
            coprocessor,
            state: Arc::new(Mutex::new(DevnetState::default())),
            finality_held: Arc::new(AtomicBool::new(false)),
            read_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DevnetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn coprocessor(&self) -> &Coprocessor {
        &self.coprocessor
    }

    pub fn deploy_counter(&self) -> Address {
        let mut state = self.lock();
        state.deployments += 1;
        let mut seed = b"fhe-counter/deploy".to_vec();
        seed.extend_from_slice(&self.chain_id.to_be_bytes());
        seed.extend_from_slice(&state.deployments.to_be_bytes());
        let address = Address::from_slice(&keccak256(&seed)[12..]);
        state.counters.insert(address, B256::ZERO);
        info!(chain_id = self.chain_id, %address, "counter deployed");
        address
    }

    pub fn deploy_counter_at(&self, address: Address) {
        self.lock().counters.insert(address, B256::ZERO);
    }

    pub fn count_of(&self, contract: &Address) -> Option<Handle> {
        self.lock().counters.get(contract).copied()
    }

    /// While held, receipts are withheld so transactions stay pending.
    pub fn hold_finality(&self) {
        self.finality_held.store(true, Ordering::SeqCst);
    }

    pub fn release_finality(&self) {
        self.finality_held.store(false, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn execute(&self, request: &TransactionRequest) -> Result<TxHash, ChainError> {
        let call = CounterCall::decode(&request.data).map_err(|e| ChainError::Rpc {
            code: -32000,
            cause: None,
            message: format!("execution reverted: {e}"),
        })?;
        let mut state = self.lock();
        let current = *state
            .counters
            .get(&request.to)
            .ok_or_else(|| ChainError::Rpc {
                code: -32000,
                cause: None,
                message: format!("no contract at {}", request.to),
            })?;

        let next = match &call {
            CounterCall::Increment { operand, proof } | CounterCall::Decrement { operand, proof } => {
                let operand = EncryptedOperand {
                    handle: *operand,
                    proof: proof.clone(),
                };
                if !self
                    .coprocessor
                    .verify_input(&operand, request.to, request.from)
                {
                    None
                } else if matches!(call, CounterCall::Increment { .. }) {
                    self.coprocessor.add(&current, &operand.handle)
                } else {
                    self.coprocessor.sub(&current, &operand.handle)
                }
            }
            CounterCall::Reset => Some(self.coprocessor.trivial(0)),
        };

        state.block_number += 1;
        let mut seed = request.data.to_vec();
        seed.extend_from_slice(request.from.as_slice());
        seed.extend_from_slice(&state.block_number.to_be_bytes());
        let hash = keccak256(&seed);
        let success = match next {
            Some(handle) => {
                self.coprocessor.allow(handle, request.to);
                self.coprocessor.allow(handle, request.from);
                state.counters.insert(request.to, handle);
                true
            }
            None => {
                warn!(tx = %hash, call = call.name(), "devnet transaction reverted");
                false
            }
        };
        let receipt = Receipt {
            transaction_hash: hash,
            block_number: state.block_number,
            success,
        };
        state.receipts.insert(hash, receipt);
        Ok(hash)
    }
}

#[async_trait]
impl ChainClient for Devnet {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !is_get_count(&request.data) {
            return Err(ChainError::Rpc {
                code: -32000,
                cause: None,
                message: "execution reverted".into(),
            });
        }
        // Calls to an address without code return empty data.
        Ok(self
            .count_of(&request.to)
            .map(encode_count)
            .unwrap_or_default())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        if self.finality_held.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.lock().receipts.get(&hash).cloned())
    }
}

/// Wallet account on the devnet. Can be told to reject prompts and counts them.
pub struct DevnetSigner {
    devnet: Devnet,
    key: SigningKey,
    address: Address,
    reject_signatures: AtomicBool,
    reject_transactions: AtomicBool,
    signature_prompts: AtomicU64,
    transaction_prompts: AtomicU64,
    prompt_delay_ms: AtomicU64,
}

impl DevnetSigner {
    pub fn new(devnet: Devnet, seed: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let address = address_from_pubkey(&key.verifying_key().to_bytes());
        Self {
            devnet,
            key,
            address,
            reject_signatures: AtomicBool::new(false),
            reject_transactions: AtomicBool::new(false),
            signature_prompts: AtomicU64::new(0),
            transaction_prompts: AtomicU64::new(0),
            prompt_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn reject_signatures(&self, reject: bool) {
        self.reject_signatures.store(reject, Ordering::SeqCst);
    }

    pub fn reject_transactions(&self, reject: bool) {
        self.reject_transactions.store(reject, Ordering::SeqCst);
    }

    /// How long the simulated wallet UI takes to answer a prompt.
    pub fn set_prompt_delay(&self, delay: Duration) {
        self.prompt_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn signature_prompts(&self) -> u64 {
        self.signature_prompts.load(Ordering::SeqCst)
    }

    pub fn transaction_prompts(&self) -> u64 {
        self.transaction_prompts.load(Ordering::SeqCst)
    }

    async fn wallet_ui(&self) {
        let delay = self.prompt_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl Signer for DevnetSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, ChainError> {
        self.signature_prompts.fetch_add(1, Ordering::SeqCst);
        self.wallet_ui().await;
        if self.reject_signatures.load(Ordering::SeqCst) {
            return Err(ChainError::user_rejected("User rejected the request."));
        }
        Ok(sign_devnet_message(&self.key, message))
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash, ChainError> {
        self.transaction_prompts.fetch_add(1, Ordering::SeqCst);
        self.wallet_ui().await;
        if self.reject_transactions.load(Ordering::SeqCst) {
            return Err(ChainError::Wallet {
                code: Some(ErrorCode::Symbolic(crate::ACTION_REJECTED.into())),
                cause: Some(ErrorCode::Numeric(crate::USER_REJECTED_CODE)),
                message: "user rejected transaction".into(),
            });
        }
        if request.from != self.address {
            return Err(ChainError::Wallet {
                code: None,
                cause: None,
                message: format!("account {} is not managed by this wallet", request.from),
            });
        }
        self.devnet.execute(&request)
    }
}
