//! SmartAccount contract core.
//!
//! The contracts run as native handlers inside [`Ledger`], dispatched by ABI
//! selector, so the calldata a client would send to a node drives the
//! in-process model unchanged.

pub mod abi;
pub mod account;
pub mod aggregator;
pub mod create2;
pub mod error;
pub mod factory;
pub mod ledger;
pub mod token;
pub mod user_op;

pub use account::SmartAccount;
pub use aggregator::{Aggregator, AllowanceData, BalanceData, TokenBalanceData};
pub use error::Revert;
pub use factory::SmartAccountFactory;
pub use ledger::{Contract, Event, Ledger, Log};
pub use token::CashToken;
pub use user_op::UserOperation;
