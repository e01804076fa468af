use crate::abi::selector;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use thiserror::Error;

/// Every way a call into the ledger can fail.
///
/// A `Revert` always rolls back the whole top-level call. Each variant maps to
/// a Solidity custom error (or `Error(string)`), so the same value can be
/// recovered from revert data returned by a real node via [`Revert::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Revert {
    /// `execute` called by someone other than the owner or the EntryPoint.
    #[error("NotFromEntryPointOrOwner()")]
    NotFromEntryPointOrOwner,

    /// `validateUserOp` called by someone other than the EntryPoint.
    #[error("NotFromEntryPoint()")]
    NotFromEntryPoint,

    /// The factory's CREATE2 deployment produced no code.
    #[error("DeploymentFailed()")]
    DeploymentFailed,

    /// The account cannot cover the prefund the EntryPoint asked for.
    #[error("InsufficientPrefund(missing={missing}, available={available})")]
    InsufficientPrefund { missing: U256, available: U256 },

    #[error("InsufficientNativeBalance(account={account:?}, balance={balance}, needed={needed})")]
    InsufficientNativeBalance {
        account: Address,
        balance: U256,
        needed: U256,
    },

    #[error("ERC20InsufficientBalance(sender={sender:?}, balance={balance}, needed={needed})")]
    Erc20InsufficientBalance {
        sender: Address,
        balance: U256,
        needed: U256,
    },

    #[error("ERC20InsufficientAllowance(spender={spender:?}, allowance={allowance}, needed={needed})")]
    Erc20InsufficientAllowance {
        spender: Address,
        allowance: U256,
        needed: U256,
    },

    #[error("ERC20InvalidReceiver({0:?})")]
    Erc20InvalidReceiver(Address),

    #[error("ERC20InvalidSender({0:?})")]
    Erc20InvalidSender(Address),

    #[error("ERC20InvalidSpender({0:?})")]
    Erc20InvalidSpender(Address),

    #[error("OwnableUnauthorizedAccount({0:?})")]
    OwnableUnauthorizedAccount(Address),

    /// Aggregator / token input rejected before any read or write.
    #[error("InvalidInput({0})")]
    InvalidInput(String),

    #[error("NonPayable()")]
    NonPayable,

    #[error("StaticCallViolation()")]
    StaticCallViolation,

    #[error("UnknownSelector(0x{})", hex::encode(.0))]
    UnknownSelector([u8; 4]),

    #[error("InvalidCalldata({0})")]
    InvalidCalldata(String),

    #[error("InvalidReturnData({0})")]
    InvalidReturnData(String),

    /// Plain `Error(string)` revert.
    #[error("{0}")]
    Message(String),

    /// Revert data that matches no known error.
    #[error("revert 0x{}", hex::encode(.0))]
    Raw(Bytes),
}

const ERROR_STRING: &str = "Error(string)";

/// Custom errors we know how to decode, with their argument layout.
const KNOWN: &[(&str, fn() -> Vec<ParamType>)] = &[
    ("NotFromEntryPointOrOwner()", no_params),
    ("NotFromEntryPoint()", no_params),
    ("DeploymentFailed()", no_params),
    ("InsufficientPrefund(uint256,uint256)", two_uints),
    ("InsufficientNativeBalance(address,uint256,uint256)", addr_two_uints),
    ("ERC20InsufficientBalance(address,uint256,uint256)", addr_two_uints),
    ("ERC20InsufficientAllowance(address,uint256,uint256)", addr_two_uints),
    ("ERC20InvalidReceiver(address)", one_addr),
    ("ERC20InvalidSender(address)", one_addr),
    ("ERC20InvalidSpender(address)", one_addr),
    ("OwnableUnauthorizedAccount(address)", one_addr),
    ("InvalidInput(string)", one_string),
    ("NonPayable()", no_params),
    ("StaticCallViolation()", no_params),
    ("UnknownSelector(bytes4)", one_bytes4),
    ("InvalidCalldata(string)", one_string),
    ("InvalidReturnData(string)", one_string),
    (ERROR_STRING, one_string),
];

fn no_params() -> Vec<ParamType> {
    Vec::new()
}

fn two_uints() -> Vec<ParamType> {
    vec![ParamType::Uint(256), ParamType::Uint(256)]
}

fn addr_two_uints() -> Vec<ParamType> {
    vec![ParamType::Address, ParamType::Uint(256), ParamType::Uint(256)]
}

fn one_addr() -> Vec<ParamType> {
    vec![ParamType::Address]
}

fn one_string() -> Vec<ParamType> {
    vec![ParamType::String]
}

fn one_bytes4() -> Vec<ParamType> {
    vec![ParamType::FixedBytes(4)]
}

impl Revert {
    /// Canonical Solidity signature and ABI arguments. `None` for [`Revert::Raw`].
    fn parts(&self) -> Option<(&'static str, Vec<Token>)> {
        let parts = match self {
            Revert::NotFromEntryPointOrOwner => ("NotFromEntryPointOrOwner()", vec![]),
            Revert::NotFromEntryPoint => ("NotFromEntryPoint()", vec![]),
            Revert::DeploymentFailed => ("DeploymentFailed()", vec![]),
            Revert::InsufficientPrefund { missing, available } => (
                "InsufficientPrefund(uint256,uint256)",
                vec![Token::Uint(*missing), Token::Uint(*available)],
            ),
            Revert::InsufficientNativeBalance {
                account,
                balance,
                needed,
            } => (
                "InsufficientNativeBalance(address,uint256,uint256)",
                vec![
                    Token::Address(*account),
                    Token::Uint(*balance),
                    Token::Uint(*needed),
                ],
            ),
            Revert::Erc20InsufficientBalance {
                sender,
                balance,
                needed,
            } => (
                "ERC20InsufficientBalance(address,uint256,uint256)",
                vec![
                    Token::Address(*sender),
                    Token::Uint(*balance),
                    Token::Uint(*needed),
                ],
            ),
            Revert::Erc20InsufficientAllowance {
                spender,
                allowance,
                needed,
            } => (
                "ERC20InsufficientAllowance(address,uint256,uint256)",
                vec![
                    Token::Address(*spender),
                    Token::Uint(*allowance),
                    Token::Uint(*needed),
                ],
            ),
            Revert::Erc20InvalidReceiver(a) => {
                ("ERC20InvalidReceiver(address)", vec![Token::Address(*a)])
            }
            Revert::Erc20InvalidSender(a) => {
                ("ERC20InvalidSender(address)", vec![Token::Address(*a)])
            }
            Revert::Erc20InvalidSpender(a) => {
                ("ERC20InvalidSpender(address)", vec![Token::Address(*a)])
            }
            Revert::OwnableUnauthorizedAccount(a) => (
                "OwnableUnauthorizedAccount(address)",
                vec![Token::Address(*a)],
            ),
            Revert::InvalidInput(msg) => ("InvalidInput(string)", vec![Token::String(msg.clone())]),
            Revert::NonPayable => ("NonPayable()", vec![]),
            Revert::StaticCallViolation => ("StaticCallViolation()", vec![]),
            Revert::UnknownSelector(sel) => (
                "UnknownSelector(bytes4)",
                vec![Token::FixedBytes(sel.to_vec())],
            ),
            Revert::InvalidCalldata(msg) => {
                ("InvalidCalldata(string)", vec![Token::String(msg.clone())])
            }
            Revert::InvalidReturnData(msg) => {
                ("InvalidReturnData(string)", vec![Token::String(msg.clone())])
            }
            Revert::Message(msg) => (ERROR_STRING, vec![Token::String(msg.clone())]),
            Revert::Raw(_) => return None,
        };
        Some(parts)
    }

    /// ABI revert data: 4-byte error selector followed by the encoded arguments.
    pub fn encode(&self) -> Bytes {
        match self.parts() {
            Some((sig, args)) => {
                let mut out = selector(sig).to_vec();
                out.extend_from_slice(&abi::encode(&args));
                Bytes::from(out)
            }
            None => match self {
                Revert::Raw(data) => data.clone(),
                _ => Bytes::default(),
            },
        }
    }

    /// Best-effort inverse of [`Revert::encode`]. Unknown data comes back as
    /// [`Revert::Raw`].
    pub fn decode(data: &[u8]) -> Revert {
        if data.len() < 4 {
            return Revert::Raw(Bytes::from(data.to_vec()));
        }
        let (head, body) = data.split_at(4);

        for (sig, params) in KNOWN {
            if selector(sig) != head {
                continue;
            }
            let decoded = abi::decode(&params(), body)
                .ok()
                .and_then(|tokens| from_tokens(sig, tokens));
            if let Some(revert) = decoded {
                return revert;
            }
        }

        Revert::Raw(Bytes::from(data.to_vec()))
    }

    /// True for the owner/EntryPoint authorization failures.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            Revert::NotFromEntryPointOrOwner | Revert::NotFromEntryPoint
        )
    }
}

fn from_tokens(sig: &str, tokens: Vec<Token>) -> Option<Revert> {
    let mut it = tokens.into_iter();
    let revert = match sig {
        "NotFromEntryPointOrOwner()" => Revert::NotFromEntryPointOrOwner,
        "NotFromEntryPoint()" => Revert::NotFromEntryPoint,
        "DeploymentFailed()" => Revert::DeploymentFailed,
        "NonPayable()" => Revert::NonPayable,
        "StaticCallViolation()" => Revert::StaticCallViolation,
        "InsufficientPrefund(uint256,uint256)" => Revert::InsufficientPrefund {
            missing: it.next()?.into_uint()?,
            available: it.next()?.into_uint()?,
        },
        "InsufficientNativeBalance(address,uint256,uint256)" => {
            Revert::InsufficientNativeBalance {
                account: it.next()?.into_address()?,
                balance: it.next()?.into_uint()?,
                needed: it.next()?.into_uint()?,
            }
        }
        "ERC20InsufficientBalance(address,uint256,uint256)" => Revert::Erc20InsufficientBalance {
            sender: it.next()?.into_address()?,
            balance: it.next()?.into_uint()?,
            needed: it.next()?.into_uint()?,
        },
        "ERC20InsufficientAllowance(address,uint256,uint256)" => {
            Revert::Erc20InsufficientAllowance {
                spender: it.next()?.into_address()?,
                allowance: it.next()?.into_uint()?,
                needed: it.next()?.into_uint()?,
            }
        }
        "ERC20InvalidReceiver(address)" => Revert::Erc20InvalidReceiver(it.next()?.into_address()?),
        "ERC20InvalidSender(address)" => Revert::Erc20InvalidSender(it.next()?.into_address()?),
        "ERC20InvalidSpender(address)" => Revert::Erc20InvalidSpender(it.next()?.into_address()?),
        "OwnableUnauthorizedAccount(address)" => {
            Revert::OwnableUnauthorizedAccount(it.next()?.into_address()?)
        }
        "InvalidInput(string)" => Revert::InvalidInput(it.next()?.into_string()?),
        "InvalidCalldata(string)" => Revert::InvalidCalldata(it.next()?.into_string()?),
        "InvalidReturnData(string)" => Revert::InvalidReturnData(it.next()?.into_string()?),
        "UnknownSelector(bytes4)" => {
            let raw = it.next()?.into_fixed_bytes()?;
            let sel: [u8; 4] = raw.as_slice().try_into().ok()?;
            Revert::UnknownSelector(sel)
        }
        ERROR_STRING => Revert::Message(it.next()?.into_string()?),
        _ => return None,
    };
    Some(revert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_error_uses_custom_error_selector() {
        let data = Revert::NotFromEntryPointOrOwner.encode();
        assert_eq!(data.len(), 4);
        assert_eq!(&data[..], selector("NotFromEntryPointOrOwner()"));
        assert_eq!(Revert::decode(&data), Revert::NotFromEntryPointOrOwner);
    }

    #[test]
    fn decodes_erc20_errors_with_arguments() {
        let err = Revert::Erc20InsufficientBalance {
            sender: Address::repeat_byte(0x11),
            balance: U256::from(5u64),
            needed: U256::from(7u64),
        };
        assert_eq!(Revert::decode(&err.encode()), err);
    }

    #[test]
    fn error_string_is_a_message() {
        let data = Revert::Message("nope".to_string()).encode();
        // Error(string) selector
        assert_eq!(&data[..4], &[0x08, 0xc3, 0x79, 0xa0]);
        assert_eq!(Revert::decode(&data), Revert::Message("nope".into()));
    }

    #[test]
    fn unknown_data_stays_raw() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x00];
        assert_eq!(
            Revert::decode(&data),
            Revert::Raw(Bytes::from(data.to_vec()))
        );
        assert_eq!(Revert::decode(&[0x01]), Revert::Raw(Bytes::from(vec![0x01])));
    }

    #[test]
    fn unknown_selector_keeps_the_selector() {
        let err = Revert::UnknownSelector([1, 2, 3, 4]);
        assert_eq!(Revert::decode(&err.encode()), err);
        assert_eq!(err.to_string(), "UnknownSelector(0x01020304)");
    }
}
