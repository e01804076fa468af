use crate::account::{self, SmartAccount};
use crate::aggregator::{self, Aggregator};
use crate::create2;
use crate::error::Revert;
use crate::factory::{self, SmartAccountFactory};
use crate::token::{self, CashToken};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::get_contract_address;
use std::collections::HashMap;

/// Code living at an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contract {
    Account(SmartAccount),
    Factory(SmartAccountFactory),
    Token(CashToken),
    Aggregator(Aggregator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    Account,
    Factory,
    Token,
    Aggregator,
}

impl ContractKind {
    pub fn name(self) -> &'static str {
        match self {
            ContractKind::Account => "SmartAccount",
            ContractKind::Factory => "SmartAccountFactory",
            ContractKind::Token => "CashToken",
            ContractKind::Aggregator => "Aggregator",
        }
    }
}

impl Contract {
    pub fn kind(&self) -> ContractKind {
        match self {
            Contract::Account(_) => ContractKind::Account,
            Contract::Factory(_) => ContractKind::Factory,
            Contract::Token(_) => ContractKind::Token,
            Contract::Aggregator(_) => ContractKind::Aggregator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Transfer {
        from: Address,
        to: Address,
        value: U256,
    },
    Approval {
        owner: Address,
        spender: Address,
        value: U256,
    },
    SmartAccountCreated {
        owner: Address,
        account: Address,
    },
}

impl Event {
    pub fn signature(&self) -> &'static str {
        use crate::abi::events;
        match self {
            Event::Transfer { .. } => events::TRANSFER,
            Event::Approval { .. } => events::APPROVAL,
            Event::SmartAccountCreated { .. } => events::SMART_ACCOUNT_CREATED,
        }
    }

    pub fn topic0(&self) -> H256 {
        H256(ethers::utils::keccak256(self.signature().as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub event: Event,
}

/// Execution context of one message call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// `msg.sender`
    pub caller: Address,
    /// Address of the code being run.
    pub address: Address,
    /// `msg.value`
    pub value: U256,
}

/// Serialized world state the contracts run against.
///
/// Calls are applied one at a time. A top-level [`Ledger::call`] is atomic:
/// any revert anywhere in the call tree restores balances, contract storage and
/// the event log to what they were before the call.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    balances: HashMap<Address, U256>,
    tx_nonces: HashMap<Address, u64>,
    contracts: HashMap<Address, Contract>,
    logs: Vec<Log>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit native currency out of thin air (genesis / faucet).
    pub fn fund(&mut self, to: Address, amount: U256) {
        let balance = self.balances.entry(to).or_default();
        *balance = balance.saturating_add(amount);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    pub fn has_code(&self, address: Address) -> bool {
        self.contracts.contains_key(&address)
    }

    pub fn contract(&self, address: Address) -> Option<&Contract> {
        self.contracts.get(&address)
    }

    pub fn account(&self, address: Address) -> Option<&SmartAccount> {
        match self.contracts.get(&address) {
            Some(Contract::Account(account)) => Some(account),
            _ => None,
        }
    }

    pub fn factory(&self, address: Address) -> Option<&SmartAccountFactory> {
        match self.contracts.get(&address) {
            Some(Contract::Factory(factory)) => Some(factory),
            _ => None,
        }
    }

    pub fn token(&self, address: Address) -> Option<&CashToken> {
        match self.contracts.get(&address) {
            Some(Contract::Token(token)) => Some(token),
            _ => None,
        }
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    /// Number of transactions sent by an externally owned address.
    pub fn tx_nonce(&self, address: Address) -> u64 {
        self.tx_nonces.get(&address).copied().unwrap_or_default()
    }

    pub(crate) fn account_mut(&mut self, address: Address) -> Result<&mut SmartAccount, Revert> {
        match self.contracts.get_mut(&address) {
            Some(Contract::Account(account)) => Ok(account),
            _ => Err(Revert::Message(format!("no SmartAccount at {address:?}"))),
        }
    }

    pub(crate) fn token_mut(&mut self, address: Address) -> Result<&mut CashToken, Revert> {
        match self.contracts.get_mut(&address) {
            Some(Contract::Token(token)) => Ok(token),
            _ => Err(Revert::Message(format!("no CashToken at {address:?}"))),
        }
    }

    pub(crate) fn emit(&mut self, address: Address, event: Event) {
        tracing::debug!(contract = ?address, event = event.signature(), "log");
        self.logs.push(Log { address, event });
    }

    /// CREATE from an externally owned account. Consumes one tx nonce.
    fn deploy(&mut self, deployer: Address, contract: Contract) -> Address {
        let nonce = self.tx_nonces.entry(deployer).or_default();
        let address = get_contract_address(deployer, *nonce);
        *nonce += 1;

        tracing::info!(deployer = ?deployer, address = ?address, kind = contract.kind().name(), "contract deployed");
        self.contracts.insert(address, contract);
        address
    }

    pub fn deploy_token(&mut self, deployer: Address, name: &str, symbol: &str) -> Address {
        self.deploy(deployer, Contract::Token(CashToken::new(deployer, name, symbol)))
    }

    pub fn deploy_factory(
        &mut self,
        deployer: Address,
        entry_point: Address,
        account_creation_code: Bytes,
    ) -> Address {
        self.deploy(
            deployer,
            Contract::Factory(SmartAccountFactory::new(entry_point, account_creation_code)),
        )
    }

    pub fn deploy_aggregator(&mut self, deployer: Address) -> Address {
        self.deploy(deployer, Contract::Aggregator(Aggregator))
    }

    /// CREATE2 from a contract. Returns the zero address when nothing was
    /// deployed: empty creation code, or code already present at the target.
    pub(crate) fn create2(
        &mut self,
        deployer: Address,
        salt: H256,
        creation_code: &[u8],
        constructor_args: &[u8],
        contract: Contract,
    ) -> Address {
        let address = create2::create2_address(
            deployer,
            salt,
            create2::init_code_hash(creation_code, constructor_args),
        );
        if creation_code.is_empty() || self.has_code(address) {
            tracing::warn!(deployer = ?deployer, address = ?address, "CREATE2 produced no code");
            return Address::zero();
        }

        tracing::info!(deployer = ?deployer, address = ?address, kind = contract.kind().name(), "contract deployed (create2)");
        self.contracts.insert(address, contract);
        address
    }

    fn transfer_native(&mut self, from: Address, to: Address, amount: U256) -> Result<(), Revert> {
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.balance(from);
        if balance < amount {
            return Err(Revert::InsufficientNativeBalance {
                account: from,
                balance,
                needed: amount,
            });
        }
        self.balances.insert(from, balance - amount);
        self.fund(to, amount);
        Ok(())
    }

    /// Top-level transaction from `caller`. All-or-nothing.
    pub fn call(
        &mut self,
        caller: Address,
        to: Address,
        value: U256,
        data: &[u8],
    ) -> Result<Bytes, Revert> {
        let snapshot = self.clone();

        let result = self.message_call(caller, to, value, data);
        if let Err(err) = &result {
            tracing::warn!(from = ?caller, to = ?to, error = %err, "call reverted; state rolled back");
            *self = snapshot;
        }

        if !self.has_code(caller) {
            *self.tx_nonces.entry(caller).or_default() += 1;
        }
        result
    }

    /// A (possibly nested) message call. Reverts propagate to the enclosing
    /// top-level [`Ledger::call`], which owns the rollback.
    pub(crate) fn message_call(
        &mut self,
        caller: Address,
        to: Address,
        value: U256,
        data: &[u8],
    ) -> Result<Bytes, Revert> {
        self.transfer_native(caller, to, value)?;

        let frame = Frame {
            caller,
            address: to,
            value,
        };
        tracing::debug!(
            from = ?caller,
            to = ?to,
            value = %value,
            selector = %hex::encode(data.get(..4).unwrap_or_default()),
            "message call"
        );

        let kind = match self.contracts.get(&to) {
            Some(contract) => contract.kind(),
            None => return Ok(Bytes::default()),
        };

        match kind {
            ContractKind::Account => account::handle(self, &frame, data),
            ContractKind::Factory => factory::handle(self, &frame, data),
            ContractKind::Token => token::handle(self, &frame, data),
            ContractKind::Aggregator => {
                if !value.is_zero() {
                    return Err(Revert::NonPayable);
                }
                aggregator::query(self, to, data)
            }
        }
    }

    /// Read-only call. State-changing methods revert with
    /// [`Revert::StaticCallViolation`].
    pub fn static_call(&self, caller: Address, to: Address, data: &[u8]) -> Result<Bytes, Revert> {
        tracing::trace!(from = ?caller, to = ?to, "static call");
        match self.contracts.get(&to) {
            None => Ok(Bytes::default()),
            Some(Contract::Account(account)) => account::view(account, data),
            Some(Contract::Factory(factory)) => factory::view(factory, to, data),
            Some(Contract::Token(token)) => token::view(token, data),
            Some(Contract::Aggregator(_)) => aggregator::query(self, to, data),
        }
    }
}

/// Error for a selector no method of `contract` answers to.
pub(crate) fn unknown_selector(data: &[u8]) -> Revert {
    match crate::abi::selector_of(data) {
        Some(sel) => Revert::UnknownSelector(sel),
        None => Revert::InvalidCalldata(format!(
            "calldata too short for a selector ({} bytes)",
            data.len()
        )),
    }
}

/// True when `data` targets one of `methods` that may write state.
pub(crate) fn is_mutating(methods: &[&crate::abi::Method], data: &[u8]) -> bool {
    methods.iter().any(|m| m.mutates && m.matches(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::token as token_abi;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn deployments_follow_sender_nonce() {
        let mut ledger = Ledger::new();
        let deployer = addr(0xd0);
        let token = ledger.deploy_token(deployer, "Cash", "CASH");
        let aggregator = ledger.deploy_aggregator(deployer);

        assert_eq!(token, get_contract_address(deployer, 0u64));
        assert_eq!(aggregator, get_contract_address(deployer, 1u64));
        assert_eq!(ledger.tx_nonce(deployer), 2);
        assert_eq!(ledger.contract(token).map(Contract::kind), Some(ContractKind::Token));
        assert!(ledger.account(token).is_none());
    }

    #[test]
    fn failed_call_restores_state_and_logs() {
        let mut ledger = Ledger::new();
        let deployer = addr(0xd0);
        let token = ledger.deploy_token(deployer, "Cash", "CASH");
        ledger
            .call(deployer, token, U256::zero(), &token_abi::mint(addr(1), U256::from(10u64)))
            .unwrap();
        let logs_before = ledger.logs().len();

        let err = ledger
            .call(addr(1), token, U256::zero(), &token_abi::transfer(addr(2), U256::from(11u64)))
            .unwrap_err();
        assert!(matches!(err, Revert::Erc20InsufficientBalance { .. }));
        assert_eq!(ledger.token(token).unwrap().balance_of(addr(1)), U256::from(10u64));
        assert_eq!(ledger.logs().len(), logs_before);
        // the sender still pays for the attempt
        assert_eq!(ledger.tx_nonce(addr(1)), 1);
    }

    #[test]
    fn value_moves_only_when_covered() {
        let mut ledger = Ledger::new();
        ledger.fund(addr(1), U256::from(5u64));

        ledger.call(addr(1), addr(2), U256::from(3u64), &[]).unwrap();
        assert_eq!(ledger.balance(addr(1)), U256::from(2u64));
        assert_eq!(ledger.balance(addr(2)), U256::from(3u64));

        let err = ledger.call(addr(1), addr(2), U256::from(3u64), &[]).unwrap_err();
        assert!(matches!(err, Revert::InsufficientNativeBalance { .. }));
        assert_eq!(ledger.balance(addr(2)), U256::from(3u64));
    }

    #[test]
    fn static_call_refuses_writes() {
        let mut ledger = Ledger::new();
        let token = ledger.deploy_token(addr(0xd0), "Cash", "CASH");

        let err = ledger
            .static_call(addr(1), token, &token_abi::transfer(addr(2), U256::one()))
            .unwrap_err();
        assert_eq!(err, Revert::StaticCallViolation);
        assert!(ledger.static_call(addr(1), addr(9), &[1, 2, 3, 4]).unwrap().is_empty());
    }

    #[test]
    fn short_calldata_is_not_a_selector() {
        assert!(matches!(unknown_selector(&[1, 2]), Revert::InvalidCalldata(_)));
        assert_eq!(unknown_selector(&[1, 2, 3, 4, 5]), Revert::UnknownSelector([1, 2, 3, 4]));
    }
}
