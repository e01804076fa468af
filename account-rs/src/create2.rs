//! Deterministic (EIP-1014 / CREATE2) address derivation for SmartAccounts.
//!
//! Everything here is a pure function of its inputs, so counterfactual
//! addresses can be computed off-chain and before deployment.

use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;

/// Per-owner deployment salt: `keccak256(owner ‖ salt)`, packed
/// (20-byte address followed by the 32-byte big-endian salt).
pub fn deployment_salt(owner: Address, salt: U256) -> H256 {
    let mut word = [0u8; 32];
    salt.to_big_endian(&mut word);

    let mut packed = Vec::with_capacity(20 + 32);
    packed.extend_from_slice(owner.as_bytes());
    packed.extend_from_slice(&word);
    H256(keccak256(packed))
}

/// SmartAccount constructor arguments: `abi.encode(entryPoint, owner)`.
pub fn account_constructor_args(entry_point: Address, owner: Address) -> Vec<u8> {
    abi::encode(&[Token::Address(entry_point), Token::Address(owner)])
}

/// Full init code for one account: creation bytecode with constructor args appended.
pub fn account_init_code(creation_code: &[u8], entry_point: Address, owner: Address) -> Vec<u8> {
    let args = account_constructor_args(entry_point, owner);
    let mut init = Vec::with_capacity(creation_code.len() + args.len());
    init.extend_from_slice(creation_code);
    init.extend_from_slice(&args);
    init
}

pub fn init_code_hash(creation_code: &[u8], constructor_args: &[u8]) -> H256 {
    let mut init = Vec::with_capacity(creation_code.len() + constructor_args.len());
    init.extend_from_slice(creation_code);
    init.extend_from_slice(constructor_args);
    H256(keccak256(init))
}

/// `keccak256(0xff ‖ deployer ‖ salt ‖ initCodeHash)[12..]`.
pub fn create2_address(deployer: Address, salt: H256, init_code_hash: H256) -> Address {
    let mut buf = [0u8; 1 + 20 + 32 + 32];
    buf[0] = 0xff;
    buf[1..21].copy_from_slice(deployer.as_bytes());
    buf[21..53].copy_from_slice(salt.as_bytes());
    buf[53..].copy_from_slice(init_code_hash.as_bytes());
    Address::from_slice(&keccak256(buf)[12..])
}

/// Address the factory at `factory` will deploy `owner`'s account to for `salt`.
pub fn predict_account_address(
    factory: Address,
    entry_point: Address,
    creation_code: &[u8],
    owner: Address,
    salt: U256,
) -> Address {
    let code_hash = init_code_hash(
        creation_code,
        &account_constructor_args(entry_point, owner),
    );
    create2_address(factory, deployment_salt(owner, salt), code_hash)
}
