use alloy_primitives::{address, Address, Bytes, B256};
use fhe_counter::{decode_count, AbiError, encode_count, CounterCall, DeploymentRegistry, RegistryError};
use proptest::prelude::*;

const ADDRESS_BOOK: &str = r#"{
  "31337": { "address": "0xABCDabcdABCDabcdABCDabcdABCDabcdABCDabcd", "chainId": 31337, "chainName": "hardhat" },
  "11155111": { "address": "0x0000000000000000000000000000000000000000", "chainId": 11155111, "chainName": "sepolia" },
  "8009": { "chainId": 8009, "chainName": "devnet" }
}"#;

#[test]
fn resolves_registered_chain_and_rejects_unknown() {
    let registry = DeploymentRegistry::from_json_str(ADDRESS_BOOK).unwrap();
    let deployment = registry.resolve(31337).expect("hardhat deployment");
    assert_eq!(
        deployment.contract_address,
        address!("ABCDabcdABCDabcdABCDabcdABCDabcdABCDabcd")
    );
    assert_eq!(deployment.chain_name, "hardhat");
    assert!(registry.resolve(1).is_none());
}

#[test]
fn zero_or_missing_address_means_not_deployed() {
    let registry = DeploymentRegistry::from_json_str(ADDRESS_BOOK).unwrap();
    assert!(registry.resolve(11155111).is_none());
    assert!(registry.resolve(8009).is_none());
    assert_eq!(registry.chain_ids(), vec![8009, 31337, 11155111]);
}

#[test]
fn mismatched_key_is_rejected() {
    let json = r#"{ "5": { "address": "0xABCDabcdABCDabcdABCDabcdABCDabcdABCDabcd", "chainId": 6, "chainName": "x" } }"#;
    let err = DeploymentRegistry::from_json_str(json).unwrap_err();
    assert!(matches!(err, RegistryError::ChainIdMismatch { key: 5, chain_id: 6 }));

    let json = r#"{ "mainnet": { "chainId": 1, "chainName": "x" } }"#;
    assert!(matches!(
        DeploymentRegistry::from_json_str(json).unwrap_err(),
        RegistryError::InvalidKey { .. }
    ));
}

#[test]
fn builtin_registry_covers_local_chain_only() {
    let registry = DeploymentRegistry::builtin();
    assert!(registry.resolve(fhe_counter::LOCAL_CHAIN_ID).is_some());
    assert!(registry.resolve(11155111).is_none());
}

#[test]
fn counter_calls_decode_to_what_was_encoded() {
    let call = CounterCall::Increment {
        operand: B256::repeat_byte(7),
        proof: Bytes::from(vec![1, 2, 3]),
    };
    assert_eq!(CounterCall::decode(&call.calldata()).unwrap(), call);
    assert_eq!(CounterCall::decode(&CounterCall::Reset.calldata()).unwrap(), CounterCall::Reset);
    assert!(CounterCall::decode(&[0xde, 0xad]).is_err());
    assert!(CounterCall::decode(&fhe_counter::get_count_calldata()).is_err());
}

#[test]
fn unknown_selector_is_reported_in_lowercase_hex() {
    let err = CounterCall::decode(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
    assert!(matches!(&err, AbiError::UnknownSelector(selector) if selector == "deadbeef"));
    assert_eq!(err.to_string(), "unknown selector 0xdeadbeef");

    let err = CounterCall::decode(&[0x00, 0x0a, 0xff, 0x10, 0x99]).unwrap_err();
    assert!(matches!(&err, AbiError::UnknownSelector(selector) if selector == "000aff10"));
}

#[test]
fn count_return_is_a_single_word() {
    let handle = B256::repeat_byte(0x42);
    let encoded = encode_count(handle);
    assert_eq!(encoded.len(), 32);
    assert_eq!(decode_count(&encoded).unwrap(), handle);
}

proptest! {
    #[test]
    fn unregistered_chains_never_resolve(chain_id in any::<u64>()) {
        let mut registry = DeploymentRegistry::new();
        registry.register(31337, Address::repeat_byte(0xab), "hardhat");
        prop_assume!(chain_id != 31337);
        prop_assert!(registry.resolve(chain_id).is_none());
    }
}
