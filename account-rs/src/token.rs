use crate::abi::token::{
    ALLOWANCE, APPROVE, BALANCE_OF, BURN, DECIMALS, MINT, NAME, OWNER, SYMBOL, TOTAL_SUPPLY,
    TRANSFER, TRANSFER_FROM,
};
use crate::abi::Method;
use crate::error::Revert;
use crate::ledger::{is_mutating, unknown_selector, Event, Frame, Ledger};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use std::collections::BTreeMap;

const MUTATORS: &[&Method] = &[&TRANSFER, &APPROVE, &TRANSFER_FROM, &MINT, &BURN];

/// ERC-20 ledger used as the value moved through SmartAccounts.
///
/// Minting is restricted to the deployer; anyone can burn their own balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashToken {
    name: String,
    symbol: String,
    decimals: u8,
    owner: Address,
    total_supply: U256,
    balances: BTreeMap<Address, U256>,
    allowances: BTreeMap<(Address, Address), U256>,
}

impl CashToken {
    pub fn new(owner: Address, name: &str, symbol: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: 18,
            owner,
            total_supply: U256::zero(),
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn balance_of(&self, holder: Address) -> U256 {
        self.balances.get(&holder).copied().unwrap_or_default()
    }

    pub fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn transfer(&mut self, from: Address, to: Address, amount: U256) -> Result<Event, Revert> {
        if from.is_zero() {
            return Err(Revert::Erc20InvalidSender(from));
        }
        if to.is_zero() {
            return Err(Revert::Erc20InvalidReceiver(to));
        }
        self.debit(from, amount)?;
        self.credit(to, amount);
        Ok(Event::Transfer {
            from,
            to,
            value: amount,
        })
    }

    pub fn approve(&mut self, owner: Address, spender: Address, amount: U256) -> Result<Event, Revert> {
        if spender.is_zero() {
            return Err(Revert::Erc20InvalidSpender(spender));
        }
        self.allowances.insert((owner, spender), amount);
        Ok(Event::Approval {
            owner,
            spender,
            value: amount,
        })
    }

    pub fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<Event, Revert> {
        let allowance = self.allowance(from, spender);
        // An allowance of U256::MAX never decreases.
        if allowance != U256::MAX {
            if allowance < amount {
                return Err(Revert::Erc20InsufficientAllowance {
                    spender,
                    allowance,
                    needed: amount,
                });
            }
            self.allowances.insert((from, spender), allowance - amount);
        }
        self.transfer(from, to, amount)
    }

    pub fn mint(&mut self, caller: Address, to: Address, amount: U256) -> Result<Event, Revert> {
        if caller != self.owner {
            return Err(Revert::OwnableUnauthorizedAccount(caller));
        }
        if to.is_zero() {
            return Err(Revert::Erc20InvalidReceiver(to));
        }
        self.total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| Revert::Message("arithmetic overflow".into()))?;
        self.credit(to, amount);
        Ok(Event::Transfer {
            from: Address::zero(),
            to,
            value: amount,
        })
    }

    pub fn burn(&mut self, from: Address, amount: U256) -> Result<Event, Revert> {
        self.debit(from, amount)?;
        self.total_supply -= amount;
        Ok(Event::Transfer {
            from,
            to: Address::zero(),
            value: amount,
        })
    }

    fn debit(&mut self, from: Address, amount: U256) -> Result<(), Revert> {
        let balance = self.balance_of(from);
        if balance < amount {
            return Err(Revert::Erc20InsufficientBalance {
                sender: from,
                balance,
                needed: amount,
            });
        }
        self.balances.insert(from, balance - amount);
        Ok(())
    }

    fn credit(&mut self, to: Address, amount: U256) {
        // Bounded by total_supply, which is overflow-checked on mint.
        let balance = self.balances.entry(to).or_default();
        *balance += amount;
    }
}

/// Read-only methods.
pub(crate) fn view(token: &CashToken, data: &[u8]) -> Result<Bytes, Revert> {
    if is_mutating(MUTATORS, data) {
        return Err(Revert::StaticCallViolation);
    }

    if BALANCE_OF.matches(data) {
        let holder = BALANCE_OF.decode_call(data)?.address()?;
        return Ok(BALANCE_OF.encode_output(&[Token::Uint(token.balance_of(holder))]));
    }
    if ALLOWANCE.matches(data) {
        let mut args = ALLOWANCE.decode_call(data)?;
        let (owner, spender) = (args.address()?, args.address()?);
        return Ok(ALLOWANCE.encode_output(&[Token::Uint(token.allowance(owner, spender))]));
    }
    if TOTAL_SUPPLY.matches(data) {
        return Ok(TOTAL_SUPPLY.encode_output(&[Token::Uint(token.total_supply)]));
    }
    if DECIMALS.matches(data) {
        return Ok(DECIMALS.encode_output(&[Token::Uint(U256::from(token.decimals))]));
    }
    if NAME.matches(data) {
        return Ok(NAME.encode_output(&[Token::String(token.name.clone())]));
    }
    if SYMBOL.matches(data) {
        return Ok(SYMBOL.encode_output(&[Token::String(token.symbol.clone())]));
    }
    if OWNER.matches(data) {
        return Ok(OWNER.encode_output(&[Token::Address(token.owner)]));
    }

    Err(unknown_selector(data))
}

pub(crate) fn handle(ledger: &mut Ledger, frame: &Frame, data: &[u8]) -> Result<Bytes, Revert> {
    if !frame.value.is_zero() {
        return Err(Revert::NonPayable);
    }

    let event = if TRANSFER.matches(data) {
        let mut args = TRANSFER.decode_call(data)?;
        let (to, amount) = (args.address()?, args.uint()?);
        ledger
            .token_mut(frame.address)?
            .transfer(frame.caller, to, amount)?
    } else if APPROVE.matches(data) {
        let mut args = APPROVE.decode_call(data)?;
        let (spender, amount) = (args.address()?, args.uint()?);
        ledger
            .token_mut(frame.address)?
            .approve(frame.caller, spender, amount)?
    } else if TRANSFER_FROM.matches(data) {
        let mut args = TRANSFER_FROM.decode_call(data)?;
        let (from, to, amount) = (args.address()?, args.address()?, args.uint()?);
        ledger
            .token_mut(frame.address)?
            .transfer_from(frame.caller, from, to, amount)?
    } else if MINT.matches(data) {
        let mut args = MINT.decode_call(data)?;
        let (to, amount) = (args.address()?, args.uint()?);
        let event = ledger
            .token_mut(frame.address)?
            .mint(frame.caller, to, amount)?;
        ledger.emit(frame.address, event);
        return Ok(Bytes::default());
    } else if BURN.matches(data) {
        let amount = BURN.decode_call(data)?.uint()?;
        let event = ledger.token_mut(frame.address)?.burn(frame.caller, amount)?;
        ledger.emit(frame.address, event);
        return Ok(Bytes::default());
    } else {
        let token = ledger
            .token(frame.address)
            .ok_or_else(|| Revert::Message("token vanished".into()))?;
        return view(token, data);
    };

    ledger.emit(frame.address, event);
    Ok(TRANSFER.encode_output(&[Token::Bool(true)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn minted() -> CashToken {
        let mut token = CashToken::new(addr(0xd0), "Cash", "CASH");
        token.mint(addr(0xd0), addr(1), U256::from(100u64)).unwrap();
        token
    }

    #[test]
    fn mint_is_owner_only() {
        let mut token = minted();
        assert_eq!(
            token.mint(addr(1), addr(1), U256::one()),
            Err(Revert::OwnableUnauthorizedAccount(addr(1)))
        );
        assert_eq!(token.total_supply(), U256::from(100u64));
    }

    #[test]
    fn transfer_moves_balance_and_rejects_overdraft() {
        let mut token = minted();
        token.transfer(addr(1), addr(2), U256::from(40u64)).unwrap();
        assert_eq!(token.balance_of(addr(1)), U256::from(60u64));
        assert_eq!(token.balance_of(addr(2)), U256::from(40u64));

        let err = token.transfer(addr(2), addr(3), U256::from(41u64)).unwrap_err();
        assert_eq!(
            err,
            Revert::Erc20InsufficientBalance {
                sender: addr(2),
                balance: U256::from(40u64),
                needed: U256::from(41u64),
            }
        );
        assert_eq!(token.balance_of(addr(2)), U256::from(40u64));
    }

    #[test]
    fn transfer_to_zero_is_rejected() {
        let mut token = minted();
        assert_eq!(
            token.transfer(addr(1), Address::zero(), U256::one()),
            Err(Revert::Erc20InvalidReceiver(Address::zero()))
        );
    }

    #[test]
    fn transfer_from_spends_allowance() {
        let mut token = minted();
        token.approve(addr(1), addr(9), U256::from(10u64)).unwrap();
        token
            .transfer_from(addr(9), addr(1), addr(3), U256::from(6u64))
            .unwrap();
        assert_eq!(token.allowance(addr(1), addr(9)), U256::from(4u64));
        assert_eq!(token.balance_of(addr(3)), U256::from(6u64));

        let err = token
            .transfer_from(addr(9), addr(1), addr(3), U256::from(5u64))
            .unwrap_err();
        assert!(matches!(err, Revert::Erc20InsufficientAllowance { .. }));
    }

    #[test]
    fn infinite_allowance_is_not_decremented() {
        let mut token = minted();
        token.approve(addr(1), addr(9), U256::MAX).unwrap();
        token
            .transfer_from(addr(9), addr(1), addr(3), U256::from(6u64))
            .unwrap();
        assert_eq!(token.allowance(addr(1), addr(9)), U256::MAX);
    }

    #[test]
    fn burn_reduces_supply() {
        let mut token = minted();
        token.burn(addr(1), U256::from(30u64)).unwrap();
        assert_eq!(token.total_supply(), U256::from(70u64));
        assert!(token.burn(addr(1), U256::from(71u64)).is_err());
    }

    #[test]
    fn static_call_rejects_writes() {
        let token = minted();
        let data = crate::abi::token::transfer(addr(2), U256::one());
        assert_eq!(view(&token, &data), Err(Revert::StaticCallViolation));
    }

    #[test]
    fn views_answer_metadata() {
        let token = minted();
        let out = view(&token, &DECIMALS.encode_call(&[])).unwrap();
        assert_eq!(DECIMALS.decode_output(&out).unwrap().uint().unwrap(), U256::from(18u64));
        let out = view(&token, &SYMBOL.encode_call(&[])).unwrap();
        assert_eq!(SYMBOL.decode_output(&out).unwrap().string().unwrap(), "CASH");
        assert!(matches!(
            view(&token, &[0xde, 0xad, 0xbe, 0xef]),
            Err(Revert::UnknownSelector(_))
        ));
    }
}
