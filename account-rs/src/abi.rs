//! ABI surface shared by the ledger dispatch and by chain clients.
//!
//! Every method the contracts expose is declared once here, by its canonical
//! Solidity signature plus input/output layouts. The ledger decodes incoming
//! calldata with these declarations and clients encode with them, so the two
//! sides cannot drift apart.

use crate::error::Revert;
use crate::user_op::UserOperation;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// First four bytes of `keccak256(signature)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Selector of a calldata blob, if it is long enough to carry one.
pub fn selector_of(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).and_then(|s| s.try_into().ok())
}

/// One external method of a contract.
#[derive(Debug)]
pub struct Method {
    pub signature: &'static str,
    inputs: fn() -> Vec<ParamType>,
    outputs: fn() -> Vec<ParamType>,
    /// Whether the method may write state (rejected under `static_call`).
    pub mutates: bool,
}

impl Method {
    pub fn selector(&self) -> [u8; 4] {
        selector(self.signature)
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        selector_of(data) == Some(self.selector())
    }

    pub fn encode_call(&self, args: &[Token]) -> Bytes {
        let mut out = self.selector().to_vec();
        out.extend_from_slice(&abi::encode(args));
        Bytes::from(out)
    }

    pub fn decode_call(&self, data: &[u8]) -> Result<Args, Revert> {
        if !self.matches(data) {
            return Err(Revert::InvalidCalldata(format!(
                "selector does not match {}",
                self.signature
            )));
        }
        let tokens = abi::decode(&(self.inputs)(), &data[4..])
            .map_err(|e| Revert::InvalidCalldata(format!("{}: {e}", self.signature)))?;
        Ok(Args::new(tokens, Revert::InvalidCalldata))
    }

    pub fn encode_output(&self, values: &[Token]) -> Bytes {
        Bytes::from(abi::encode(values))
    }

    pub fn decode_output(&self, data: &[u8]) -> Result<Args, Revert> {
        let tokens = abi::decode(&(self.outputs)(), data)
            .map_err(|e| Revert::InvalidReturnData(format!("{}: {e}", self.signature)))?;
        Ok(Args::new(tokens, Revert::InvalidReturnData))
    }
}

/// Positional reader over decoded ABI tokens.
#[derive(Debug)]
pub struct Args {
    tokens: std::vec::IntoIter<Token>,
    /// Calldata and return data fail with different variants.
    fault: fn(String) -> Revert,
}

impl Args {
    fn new(tokens: Vec<Token>, fault: fn(String) -> Revert) -> Self {
        Self {
            tokens: tokens.into_iter(),
            fault,
        }
    }

    fn next(&mut self, what: &str) -> Result<Token, Revert> {
        self.tokens
            .next()
            .ok_or_else(|| (self.fault)(format!("missing {what}")))
    }

    pub fn address(&mut self) -> Result<Address, Revert> {
        self.next("address")?
            .into_address()
            .ok_or_else(|| (self.fault)("expected address".into()))
    }

    pub fn uint(&mut self) -> Result<U256, Revert> {
        self.next("uint")?
            .into_uint()
            .ok_or_else(|| (self.fault)("expected uint".into()))
    }

    pub fn boolean(&mut self) -> Result<bool, Revert> {
        self.next("bool")?
            .into_bool()
            .ok_or_else(|| (self.fault)("expected bool".into()))
    }

    pub fn string(&mut self) -> Result<String, Revert> {
        self.next("string")?
            .into_string()
            .ok_or_else(|| (self.fault)("expected string".into()))
    }

    pub fn bytes(&mut self) -> Result<Bytes, Revert> {
        self.next("bytes")?
            .into_bytes()
            .map(Bytes::from)
            .ok_or_else(|| (self.fault)("expected bytes".into()))
    }

    pub fn bytes32(&mut self) -> Result<H256, Revert> {
        let raw = self
            .next("bytes32")?
            .into_fixed_bytes()
            .ok_or_else(|| (self.fault)("expected bytes32".into()))?;
        if raw.len() != 32 {
            return Err((self.fault)(format!(
                "expected 32 bytes, got {}",
                raw.len()
            )));
        }
        Ok(H256::from_slice(&raw))
    }

    pub fn addresses(&mut self) -> Result<Vec<Address>, Revert> {
        let fault = self.fault;
        self.array("address[]")?
            .into_iter()
            .map(|t| {
                t.into_address()
                    .ok_or_else(|| fault("expected address[]".into()))
            })
            .collect()
    }

    pub fn user_op(&mut self) -> Result<UserOperation, Revert> {
        UserOperation::from_token(self.next("userOp")?)
    }

    pub fn array(&mut self, what: &str) -> Result<Vec<Token>, Revert> {
        self.next(what)?
            .into_array()
            .ok_or_else(|| (self.fault)(format!("expected {what}")))
    }

    pub fn tuple(&mut self, what: &str) -> Result<Vec<Token>, Revert> {
        self.next(what)?
            .into_tuple()
            .ok_or_else(|| (self.fault)(format!("expected {what}")))
    }
}

fn none() -> Vec<ParamType> {
    Vec::new()
}

fn address() -> Vec<ParamType> {
    vec![ParamType::Address]
}

fn uint() -> Vec<ParamType> {
    vec![ParamType::Uint(256)]
}

fn boolean() -> Vec<ParamType> {
    vec![ParamType::Bool]
}

fn string() -> Vec<ParamType> {
    vec![ParamType::String]
}

fn bytes() -> Vec<ParamType> {
    vec![ParamType::Bytes]
}

fn address_uint() -> Vec<ParamType> {
    vec![ParamType::Address, ParamType::Uint(256)]
}

fn address_address() -> Vec<ParamType> {
    vec![ParamType::Address, ParamType::Address]
}

fn address_address_uint() -> Vec<ParamType> {
    vec![ParamType::Address, ParamType::Address, ParamType::Uint(256)]
}

fn address_uint_bytes() -> Vec<ParamType> {
    vec![ParamType::Address, ParamType::Uint(256), ParamType::Bytes]
}

fn address_list() -> ParamType {
    ParamType::Array(Box::new(ParamType::Address))
}

fn balance_list() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Uint(256),
    ])))
}

fn allowance_list() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
    ])))
}

fn uint8() -> Vec<ParamType> {
    vec![ParamType::Uint(8)]
}

fn token_and_accounts() -> Vec<ParamType> {
    vec![ParamType::Address, address_list()]
}

fn tokens_and_accounts() -> Vec<ParamType> {
    vec![address_list(), address_list()]
}

fn token_owners_spenders() -> Vec<ParamType> {
    vec![ParamType::Address, address_list(), address_list()]
}

fn balances_out() -> Vec<ParamType> {
    vec![balance_list()]
}

fn allowances_out() -> Vec<ParamType> {
    vec![allowance_list()]
}

fn balances_and_allowances_out() -> Vec<ParamType> {
    vec![balance_list(), allowance_list()]
}

fn token_balances_out() -> Vec<ParamType> {
    // (token, account, balance)[]
    vec![ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
    ])))]
}

fn validate_user_op_inputs() -> Vec<ParamType> {
    vec![
        UserOperation::param_type(),
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
    ]
}

/// `SmartAccount` external interface.
pub mod account {
    use super::*;

    pub const EXECUTE: Method = Method {
        signature: "execute(address,uint256,bytes)",
        inputs: address_uint_bytes,
        outputs: bytes,
        mutates: true,
    };

    pub const VALIDATE_USER_OP: Method = Method {
        signature: "validateUserOp((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes),bytes32,uint256)",
        inputs: validate_user_op_inputs,
        outputs: uint,
        mutates: true,
    };

    pub const OWNER: Method = Method {
        signature: "owner()",
        inputs: none,
        outputs: address,
        mutates: false,
    };

    pub const GET_ENTRY_POINT: Method = Method {
        signature: "getEntryPoint()",
        inputs: none,
        outputs: address,
        mutates: false,
    };

    pub const GET_NONCE: Method = Method {
        signature: "getNonce()",
        inputs: none,
        outputs: uint,
        mutates: false,
    };

    pub fn execute(target: Address, value: U256, data: Bytes) -> Bytes {
        EXECUTE.encode_call(&[
            Token::Address(target),
            Token::Uint(value),
            Token::Bytes(data.to_vec()),
        ])
    }

    pub fn validate_user_op(op: &UserOperation, op_hash: H256, missing_funds: U256) -> Bytes {
        VALIDATE_USER_OP.encode_call(&[
            op.to_token(),
            Token::FixedBytes(op_hash.as_bytes().to_vec()),
            Token::Uint(missing_funds),
        ])
    }
}

/// `SmartAccountFactory` external interface.
pub mod factory {
    use super::*;

    pub const GET_ADDRESS: Method = Method {
        signature: "getAddress(address,uint256)",
        inputs: address_uint,
        outputs: address,
        mutates: false,
    };

    pub const CREATE_ACCOUNT: Method = Method {
        signature: "createAccount(address,uint256)",
        inputs: address_uint,
        outputs: address,
        mutates: true,
    };

    pub const GET_ENTRY_POINT: Method = Method {
        signature: "getEntryPoint()",
        inputs: none,
        outputs: address,
        mutates: false,
    };

    pub fn get_address(owner: Address, salt: U256) -> Bytes {
        GET_ADDRESS.encode_call(&[Token::Address(owner), Token::Uint(salt)])
    }

    pub fn create_account(owner: Address, salt: U256) -> Bytes {
        CREATE_ACCOUNT.encode_call(&[Token::Address(owner), Token::Uint(salt)])
    }
}

/// `CashToken` (ERC-20) external interface.
pub mod token {
    use super::*;

    pub const NAME: Method = Method {
        signature: "name()",
        inputs: none,
        outputs: string,
        mutates: false,
    };

    pub const SYMBOL: Method = Method {
        signature: "symbol()",
        inputs: none,
        outputs: string,
        mutates: false,
    };

    pub const DECIMALS: Method = Method {
        signature: "decimals()",
        inputs: none,
        outputs: uint8,
        mutates: false,
    };

    pub const TOTAL_SUPPLY: Method = Method {
        signature: "totalSupply()",
        inputs: none,
        outputs: uint,
        mutates: false,
    };

    pub const BALANCE_OF: Method = Method {
        signature: "balanceOf(address)",
        inputs: address,
        outputs: uint,
        mutates: false,
    };

    pub const ALLOWANCE: Method = Method {
        signature: "allowance(address,address)",
        inputs: address_address,
        outputs: uint,
        mutates: false,
    };

    pub const OWNER: Method = Method {
        signature: "owner()",
        inputs: none,
        outputs: address,
        mutates: false,
    };

    pub const TRANSFER: Method = Method {
        signature: "transfer(address,uint256)",
        inputs: address_uint,
        outputs: boolean,
        mutates: true,
    };

    pub const APPROVE: Method = Method {
        signature: "approve(address,uint256)",
        inputs: address_uint,
        outputs: boolean,
        mutates: true,
    };

    pub const TRANSFER_FROM: Method = Method {
        signature: "transferFrom(address,address,uint256)",
        inputs: address_address_uint,
        outputs: boolean,
        mutates: true,
    };

    pub const MINT: Method = Method {
        signature: "mint(address,uint256)",
        inputs: address_uint,
        outputs: none,
        mutates: true,
    };

    pub const BURN: Method = Method {
        signature: "burn(uint256)",
        inputs: uint,
        outputs: none,
        mutates: true,
    };

    pub fn balance_of(holder: Address) -> Bytes {
        BALANCE_OF.encode_call(&[Token::Address(holder)])
    }

    pub fn allowance(owner: Address, spender: Address) -> Bytes {
        ALLOWANCE.encode_call(&[Token::Address(owner), Token::Address(spender)])
    }

    pub fn transfer(to: Address, amount: U256) -> Bytes {
        TRANSFER.encode_call(&[Token::Address(to), Token::Uint(amount)])
    }

    pub fn approve(spender: Address, amount: U256) -> Bytes {
        APPROVE.encode_call(&[Token::Address(spender), Token::Uint(amount)])
    }

    pub fn transfer_from(from: Address, to: Address, amount: U256) -> Bytes {
        TRANSFER_FROM.encode_call(&[
            Token::Address(from),
            Token::Address(to),
            Token::Uint(amount),
        ])
    }

    pub fn mint(to: Address, amount: U256) -> Bytes {
        MINT.encode_call(&[Token::Address(to), Token::Uint(amount)])
    }

    pub fn burn(amount: U256) -> Bytes {
        BURN.encode_call(&[Token::Uint(amount)])
    }
}

/// `Aggregator` external (read-only) interface.
pub mod aggregator {
    use super::*;
    use crate::aggregator::{AllowanceData, BalanceData, TokenBalanceData};

    pub const GET_BALANCES: Method = Method {
        signature: "getBalances(address,address[])",
        inputs: token_and_accounts,
        outputs: balances_out,
        mutates: false,
    };

    pub const GET_ALLOWANCES: Method = Method {
        signature: "getAllowances(address,address[])",
        inputs: token_and_accounts,
        outputs: allowances_out,
        mutates: false,
    };

    pub const GET_SPECIFIC_ALLOWANCES: Method = Method {
        signature: "getSpecificAllowances(address,address[],address[])",
        inputs: token_owners_spenders,
        outputs: allowances_out,
        mutates: false,
    };

    pub const GET_BALANCES_AND_ALLOWANCES: Method = Method {
        signature: "getBalancesAndAllowances(address,address[])",
        inputs: token_and_accounts,
        outputs: balances_and_allowances_out,
        mutates: false,
    };

    pub const GET_MULTI_TOKEN_BALANCES: Method = Method {
        signature: "getMultiTokenBalances(address[],address[])",
        inputs: tokens_and_accounts,
        outputs: token_balances_out,
        mutates: false,
    };

    fn address_array(list: &[Address]) -> Token {
        Token::Array(list.iter().copied().map(Token::Address).collect())
    }

    pub fn get_balances(token: Address, accounts: &[Address]) -> Bytes {
        GET_BALANCES.encode_call(&[Token::Address(token), address_array(accounts)])
    }

    pub fn get_allowances(token: Address, accounts: &[Address]) -> Bytes {
        GET_ALLOWANCES.encode_call(&[Token::Address(token), address_array(accounts)])
    }

    pub fn get_specific_allowances(token: Address, owners: &[Address], spenders: &[Address]) -> Bytes {
        GET_SPECIFIC_ALLOWANCES.encode_call(&[
            Token::Address(token),
            address_array(owners),
            address_array(spenders),
        ])
    }

    pub fn get_balances_and_allowances(token: Address, accounts: &[Address]) -> Bytes {
        GET_BALANCES_AND_ALLOWANCES.encode_call(&[Token::Address(token), address_array(accounts)])
    }

    pub fn get_multi_token_balances(tokens: &[Address], accounts: &[Address]) -> Bytes {
        GET_MULTI_TOKEN_BALANCES.encode_call(&[address_array(tokens), address_array(accounts)])
    }

    pub fn balances_token(list: &[BalanceData]) -> Token {
        Token::Array(list.iter().map(BalanceData::to_token).collect())
    }

    pub fn allowances_token(list: &[AllowanceData]) -> Token {
        Token::Array(list.iter().map(AllowanceData::to_token).collect())
    }

    pub fn token_balances_token(list: &[TokenBalanceData]) -> Token {
        Token::Array(list.iter().map(TokenBalanceData::to_token).collect())
    }

    pub fn decode_balances(args: &mut Args) -> Result<Vec<BalanceData>, Revert> {
        args.array("balances")?
            .into_iter()
            .map(BalanceData::from_token)
            .collect()
    }

    pub fn decode_allowances(args: &mut Args) -> Result<Vec<AllowanceData>, Revert> {
        args.array("allowances")?
            .into_iter()
            .map(AllowanceData::from_token)
            .collect()
    }

    pub fn decode_token_balances(args: &mut Args) -> Result<Vec<TokenBalanceData>, Revert> {
        args.array("tokenBalances")?
            .into_iter()
            .map(TokenBalanceData::from_token)
            .collect()
    }
}

/// Event signatures (topic0 = keccak256 of the signature).
pub mod events {
    pub const SMART_ACCOUNT_CREATED: &str = "SmartAccountCreated(address,address)";
    pub const TRANSFER: &str = "Transfer(address,address,uint256)";
    pub const APPROVAL: &str = "Approval(address,address,uint256)";
}
