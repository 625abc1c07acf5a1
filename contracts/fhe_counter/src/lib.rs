use alloy_primitives::{address, Address, Bytes, B256};
use alloy_sol_types::{sol, SolCall};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

sol! {
    interface IFHECounter {
        function getCount() external view returns (bytes32 count);
        function increment(bytes32 inputEuint32, bytes calldata inputProof) external;
        function decrement(bytes32 inputEuint32, bytes calldata inputProof) external;
        function reset() external;
    }
}

pub use IFHECounter::{decrementCall, getCountCall, incrementCall, resetCall};

/// Chain id of the local hardhat/anvil development network.
pub const LOCAL_CHAIN_ID: u64 = 31337;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub chain_id: u64,
    pub contract_address: Address,
    pub chain_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryEntry {
    #[serde(default)]
    address: Option<Address>,
    chain_id: u64,
    chain_name: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry key {key:?} is not a chain id")]
    InvalidKey { key: String },
    #[error("registry key {key} does not match entry chain id {chain_id}")]
    ChainIdMismatch { key: u64, chain_id: u64 },
    #[error("malformed registry json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address book of counter deployments, keyed by chain id.
#[derive(Debug, Clone, Default)]
pub struct DeploymentRegistry {
    entries: BTreeMap<u64, RegistryEntry>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            LOCAL_CHAIN_ID,
            address!("5FbDB2315678afecb367f032d93F642f64180aa3"),
            "hardhat",
        );
        registry.register(11155111, Address::ZERO, "sepolia");
        registry
    }

    pub fn register(&mut self, chain_id: u64, contract_address: Address, chain_name: &str) {
        self.entries.insert(
            chain_id,
            RegistryEntry {
                address: Some(contract_address),
                chain_id,
                chain_name: chain_name.to_string(),
            },
        );
    }

    /// Parses the `{"<chainId>": {"address", "chainId", "chainName"}}` address book
    /// emitted by the deploy tooling.
    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let raw: BTreeMap<String, RegistryEntry> = serde_json::from_str(json)?;
        let mut entries = BTreeMap::new();
        for (key, entry) in raw {
            let chain_id: u64 = key
                .parse()
                .map_err(|_| RegistryError::InvalidKey { key: key.clone() })?;
            if chain_id != entry.chain_id {
                return Err(RegistryError::ChainIdMismatch {
                    key: chain_id,
                    chain_id: entry.chain_id,
                });
            }
            entries.insert(chain_id, entry);
        }
        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Returns `None` for unknown chains and for entries that carry no address or the
    /// zero address.
    pub fn resolve(&self, chain_id: u64) -> Option<Deployment> {
        let entry = self.entries.get(&chain_id)?;
        let contract_address = entry.address.filter(|a| *a != Address::ZERO)?;
        Some(Deployment {
            chain_id,
            contract_address,
            chain_name: entry.chain_name.clone(),
        })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("calldata too short")]
    Truncated,
    #[error("unknown selector 0x{0}")]
    UnknownSelector(String),
    #[error("abi decode failed: {0}")]
    Decode(#[from] alloy_sol_types::Error),
}

/// State-changing counter calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterCall {
    Increment { operand: B256, proof: Bytes },
    Decrement { operand: B256, proof: Bytes },
    Reset,
}

impl CounterCall {
    pub fn name(&self) -> &'static str {
        match self {
            CounterCall::Increment { .. } => "increment",
            CounterCall::Decrement { .. } => "decrement",
            CounterCall::Reset => "reset",
        }
    }

    pub fn calldata(&self) -> Bytes {
        let encoded = match self {
            CounterCall::Increment { operand, proof } => incrementCall {
                inputEuint32: *operand,
                inputProof: proof.clone(),
            }
            .abi_encode(),
            CounterCall::Decrement { operand, proof } => decrementCall {
                inputEuint32: *operand,
                inputProof: proof.clone(),
            }
            .abi_encode(),
            CounterCall::Reset => resetCall {}.abi_encode(),
        };
        Bytes::from(encoded)
    }

    pub fn decode(data: &[u8]) -> Result<Self, AbiError> {
        if data.len() < 4 {
            return Err(AbiError::Truncated);
        }
        let selector: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if selector == incrementCall::SELECTOR {
            let call = incrementCall::abi_decode(data, true)?;
            Ok(CounterCall::Increment {
                operand: call.inputEuint32,
                proof: call.inputProof,
            })
        } else if selector == decrementCall::SELECTOR {
            let call = decrementCall::abi_decode(data, true)?;
            Ok(CounterCall::Decrement {
                operand: call.inputEuint32,
                proof: call.inputProof,
            })
        } else if selector == resetCall::SELECTOR {
            resetCall::abi_decode(data, true)?;
            Ok(CounterCall::Reset)
        } else {
            Err(AbiError::UnknownSelector(hex::encode(selector)))
        }
    }
}

pub fn get_count_calldata() -> Bytes {
    Bytes::from(getCountCall {}.abi_encode())
}

pub fn is_get_count(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == getCountCall::SELECTOR
}

pub fn encode_count(handle: B256) -> Bytes {
    Bytes::from(handle.to_vec())
}

pub fn decode_count(data: &[u8]) -> Result<B256, AbiError> {
    let ret = getCountCall::abi_decode_returns(data, true)?;
    Ok(ret.count)
}
