use crate::abi::factory::{CREATE_ACCOUNT, GET_ADDRESS, GET_ENTRY_POINT};
use crate::abi::Method;
use crate::account::SmartAccount;
use crate::create2;
use crate::error::Revert;
use crate::ledger::{is_mutating, unknown_selector, Contract, Event, Frame, Ledger};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};

const MUTATORS: &[&Method] = &[&CREATE_ACCOUNT];

/// Deploys SmartAccounts with CREATE2 so their address is known up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartAccountFactory {
    entry_point: Address,
    account_creation_code: Bytes,
}

impl SmartAccountFactory {
    pub fn new(entry_point: Address, account_creation_code: Bytes) -> Self {
        Self {
            entry_point,
            account_creation_code,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn creation_code(&self) -> &Bytes {
        &self.account_creation_code
    }

    /// Counterfactual address for `(owner, salt)` when this factory lives at `factory`.
    pub fn get_address(&self, factory: Address, owner: Address, salt: U256) -> Address {
        create2::predict_account_address(
            factory,
            self.entry_point,
            &self.account_creation_code,
            owner,
            salt,
        )
    }
}

pub(crate) fn view(factory: &SmartAccountFactory, at: Address, data: &[u8]) -> Result<Bytes, Revert> {
    if is_mutating(MUTATORS, data) {
        return Err(Revert::StaticCallViolation);
    }

    if GET_ADDRESS.matches(data) {
        let mut args = GET_ADDRESS.decode_call(data)?;
        let (owner, salt) = (args.address()?, args.uint()?);
        Ok(GET_ADDRESS.encode_output(&[Token::Address(factory.get_address(at, owner, salt))]))
    } else if GET_ENTRY_POINT.matches(data) {
        Ok(GET_ENTRY_POINT.encode_output(&[Token::Address(factory.entry_point)]))
    } else {
        Err(unknown_selector(data))
    }
}

pub(crate) fn handle(ledger: &mut Ledger, frame: &Frame, data: &[u8]) -> Result<Bytes, Revert> {
    if !frame.value.is_zero() {
        return Err(Revert::NonPayable);
    }

    let factory = ledger
        .factory(frame.address)
        .ok_or_else(|| Revert::Message(format!("no SmartAccountFactory at {:?}", frame.address)))?
        .clone();

    if !CREATE_ACCOUNT.matches(data) {
        return view(&factory, frame.address, data);
    }

    let mut args = CREATE_ACCOUNT.decode_call(data)?;
    let (owner, salt) = (args.address()?, args.uint()?);

    let predicted = factory.get_address(frame.address, owner, salt);
    if ledger.has_code(predicted) {
        tracing::debug!(owner = ?owner, account = ?predicted, "account already deployed");
        return Ok(CREATE_ACCOUNT.encode_output(&[Token::Address(predicted)]));
    }

    let deployed = ledger.create2(
        frame.address,
        create2::deployment_salt(owner, salt),
        &factory.account_creation_code,
        &create2::account_constructor_args(factory.entry_point, owner),
        Contract::Account(SmartAccount::new(owner, factory.entry_point)),
    );
    if deployed.is_zero() {
        return Err(Revert::DeploymentFailed);
    }

    ledger.emit(
        frame.address,
        Event::SmartAccountCreated {
            owner,
            account: deployed,
        },
    );
    tracing::info!(owner = ?owner, salt = %salt, account = ?deployed, "smart account created");
    Ok(CREATE_ACCOUNT.encode_output(&[Token::Address(deployed)]))
}
