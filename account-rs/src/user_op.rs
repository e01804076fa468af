use crate::error::Revert;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Validation result returned by `validateUserOp` on success.
pub const SIG_VALIDATION_SUCCESS: u64 = 0;
/// Validation result for a bad signature or a stale nonce.
pub const SIG_VALIDATION_FAILED: u64 = 1;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Serializes to the bundler JSON-RPC shape: camelCase keys, hex quantities
/// and hex byte strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// ABI type of the struct as it appears in `validateUserOp`.
    pub fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Bytes,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Bytes,
        ])
    }

    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code.to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes(self.paymaster_and_data.to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ])
    }

    pub fn from_token(token: Token) -> Result<Self, Revert> {
        let fields = token.into_tuple().ok_or_else(malformed)?;
        let [sender, nonce, init_code, call_data, call_gas_limit, verification_gas_limit, pre_verification_gas, max_fee_per_gas, max_priority_fee_per_gas, paymaster_and_data, signature]: [Token; 11] = fields
            .try_into()
            .map_err(|_| malformed())?;

        Ok(Self {
            sender: sender.into_address().ok_or_else(malformed)?,
            nonce: uint(nonce)?,
            init_code: bytes(init_code)?,
            call_data: bytes(call_data)?,
            call_gas_limit: uint(call_gas_limit)?,
            verification_gas_limit: uint(verification_gas_limit)?,
            pre_verification_gas: uint(pre_verification_gas)?,
            max_fee_per_gas: uint(max_fee_per_gas)?,
            max_priority_fee_per_gas: uint(max_priority_fee_per_gas)?,
            paymaster_and_data: bytes(paymaster_and_data)?,
            signature: bytes(signature)?,
        })
    }

    /// v0.6 `UserOperationLib.pack`: every dynamic field replaced by its hash,
    /// signature excluded.
    pub fn pack(&self) -> Vec<u8> {
        abi::encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }

    /// `EntryPoint.getUserOpHash`, computed locally.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack());
        H256(keccak256(abi::encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }

    /// Address of the factory named in `initCode`, if any.
    pub fn factory(&self) -> Option<Address> {
        self.init_code.get(..20).map(Address::from_slice)
    }
}

fn malformed() -> Revert {
    Revert::InvalidCalldata("malformed UserOperation tuple".into())
}

fn uint(token: Token) -> Result<U256, Revert> {
    token.into_uint().ok_or_else(malformed)
}

fn bytes(token: Token) -> Result<Bytes, Revert> {
    token.into_bytes().map(Bytes::from).ok_or_else(malformed)
}
