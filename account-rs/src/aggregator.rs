//! Read-only batch queries over CashToken balances and allowances.
//!
//! The aggregator holds no state. Each query checks its inputs before any
//! token read and then answers from `balanceOf` / `allowance` static calls, so
//! results follow input order and repeat exactly while the ledger is unchanged.

use crate::abi::aggregator::{
    allowances_token, balances_token, token_balances_token, GET_ALLOWANCES, GET_BALANCES,
    GET_BALANCES_AND_ALLOWANCES, GET_MULTI_TOKEN_BALANCES, GET_SPECIFIC_ALLOWANCES,
};
use crate::abi::token::{self as token_abi, ALLOWANCE, BALANCE_OF};
use crate::error::Revert;
use crate::ledger::{unknown_selector, Ledger};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aggregator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceData {
    pub account: Address,
    pub balance: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceData {
    pub owner: Address,
    pub spender: Address,
    pub allowance: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalanceData {
    pub token: Address,
    pub account: Address,
    pub balance: U256,
}

fn malformed(what: &str) -> Revert {
    Revert::InvalidReturnData(format!("malformed {what} tuple"))
}

fn fields<const N: usize>(token: Token, what: &str) -> Result<[Token; N], Revert> {
    token
        .into_tuple()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| malformed(what))
}

impl BalanceData {
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![Token::Address(self.account), Token::Uint(self.balance)])
    }

    pub fn from_token(token: Token) -> Result<Self, Revert> {
        let [account, balance] = fields(token, "BalanceData")?;
        Ok(Self {
            account: account.into_address().ok_or_else(|| malformed("BalanceData"))?,
            balance: balance.into_uint().ok_or_else(|| malformed("BalanceData"))?,
        })
    }
}

impl AllowanceData {
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.owner),
            Token::Address(self.spender),
            Token::Uint(self.allowance),
        ])
    }

    pub fn from_token(token: Token) -> Result<Self, Revert> {
        let [owner, spender, allowance] = fields(token, "AllowanceData")?;
        Ok(Self {
            owner: owner.into_address().ok_or_else(|| malformed("AllowanceData"))?,
            spender: spender.into_address().ok_or_else(|| malformed("AllowanceData"))?,
            allowance: allowance.into_uint().ok_or_else(|| malformed("AllowanceData"))?,
        })
    }
}

impl TokenBalanceData {
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.token),
            Token::Address(self.account),
            Token::Uint(self.balance),
        ])
    }

    pub fn from_token(token: Token) -> Result<Self, Revert> {
        let [token, account, balance] = fields(token, "TokenBalanceData")?;
        Ok(Self {
            token: token.into_address().ok_or_else(|| malformed("TokenBalanceData"))?,
            account: account.into_address().ok_or_else(|| malformed("TokenBalanceData"))?,
            balance: balance.into_uint().ok_or_else(|| malformed("TokenBalanceData"))?,
        })
    }
}

fn require_token(token: Address) -> Result<(), Revert> {
    if token.is_zero() {
        return Err(Revert::InvalidInput("token is the zero address".into()));
    }
    Ok(())
}

fn require_accounts(list: &[Address], what: &str) -> Result<(), Revert> {
    if list.is_empty() {
        return Err(Revert::InvalidInput(format!("{what} must not be empty")));
    }
    if let Some(i) = list.iter().position(Address::is_zero) {
        return Err(Revert::InvalidInput(format!("{what}[{i}] is the zero address")));
    }
    Ok(())
}

/// Token reads issued on behalf of the aggregator at `caller`.
struct Reader<'a> {
    ledger: &'a Ledger,
    caller: Address,
}

impl Reader<'_> {
    fn balance_of(&self, token: Address, holder: Address) -> Result<U256, Revert> {
        let out = self
            .ledger
            .static_call(self.caller, token, &token_abi::balance_of(holder))?;
        BALANCE_OF.decode_output(&out)?.uint()
    }

    fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256, Revert> {
        let out = self
            .ledger
            .static_call(self.caller, token, &token_abi::allowance(owner, spender))?;
        ALLOWANCE.decode_output(&out)?.uint()
    }

    fn balances(&self, token: Address, accounts: &[Address]) -> Result<Vec<BalanceData>, Revert> {
        accounts
            .iter()
            .map(|&account| {
                Ok(BalanceData {
                    account,
                    balance: self.balance_of(token, account)?,
                })
            })
            .collect()
    }

    /// Every ordered pair `(owner, spender)` with owner != spender, owner-major.
    fn all_allowances(&self, token: Address, accounts: &[Address]) -> Result<Vec<AllowanceData>, Revert> {
        let mut out = Vec::with_capacity(accounts.len() * accounts.len().saturating_sub(1));
        for (i, &owner) in accounts.iter().enumerate() {
            for (j, &spender) in accounts.iter().enumerate() {
                if i == j {
                    continue;
                }
                out.push(AllowanceData {
                    owner,
                    spender,
                    allowance: self.allowance(token, owner, spender)?,
                });
            }
        }
        Ok(out)
    }
}

/// Dispatch one aggregator query. Never writes.
pub(crate) fn query(ledger: &Ledger, aggregator: Address, data: &[u8]) -> Result<Bytes, Revert> {
    let reader = Reader {
        ledger,
        caller: aggregator,
    };

    if GET_BALANCES.matches(data) {
        let mut args = GET_BALANCES.decode_call(data)?;
        let (token, accounts) = (args.address()?, args.addresses()?);
        require_token(token)?;
        require_accounts(&accounts, "accounts")?;

        let balances = reader.balances(token, &accounts)?;
        Ok(GET_BALANCES.encode_output(&[balances_token(&balances)]))
    } else if GET_ALLOWANCES.matches(data) {
        let mut args = GET_ALLOWANCES.decode_call(data)?;
        let (token, accounts) = (args.address()?, args.addresses()?);
        require_token(token)?;
        require_accounts(&accounts, "accounts")?;

        let allowances = reader.all_allowances(token, &accounts)?;
        Ok(GET_ALLOWANCES.encode_output(&[allowances_token(&allowances)]))
    } else if GET_SPECIFIC_ALLOWANCES.matches(data) {
        let mut args = GET_SPECIFIC_ALLOWANCES.decode_call(data)?;
        let (token, owners, spenders) = (args.address()?, args.addresses()?, args.addresses()?);
        require_token(token)?;
        require_accounts(&owners, "owners")?;
        require_accounts(&spenders, "spenders")?;
        if owners.len() != spenders.len() {
            return Err(Revert::InvalidInput(format!(
                "owners ({}) and spenders ({}) differ in length",
                owners.len(),
                spenders.len()
            )));
        }

        let allowances = owners
            .iter()
            .zip(&spenders)
            .map(|(&owner, &spender)| {
                Ok(AllowanceData {
                    owner,
                    spender,
                    allowance: reader.allowance(token, owner, spender)?,
                })
            })
            .collect::<Result<Vec<_>, Revert>>()?;
        Ok(GET_SPECIFIC_ALLOWANCES.encode_output(&[allowances_token(&allowances)]))
    } else if GET_BALANCES_AND_ALLOWANCES.matches(data) {
        let mut args = GET_BALANCES_AND_ALLOWANCES.decode_call(data)?;
        let (token, accounts) = (args.address()?, args.addresses()?);
        require_token(token)?;
        require_accounts(&accounts, "accounts")?;

        let balances = reader.balances(token, &accounts)?;
        let allowances = reader.all_allowances(token, &accounts)?;
        Ok(GET_BALANCES_AND_ALLOWANCES
            .encode_output(&[balances_token(&balances), allowances_token(&allowances)]))
    } else if GET_MULTI_TOKEN_BALANCES.matches(data) {
        let mut args = GET_MULTI_TOKEN_BALANCES.decode_call(data)?;
        let (tokens, accounts) = (args.addresses()?, args.addresses()?);
        require_accounts(&tokens, "tokens")?;
        require_accounts(&accounts, "accounts")?;

        let mut out = Vec::with_capacity(tokens.len() * accounts.len());
        for &token in &tokens {
            for &account in &accounts {
                out.push(TokenBalanceData {
                    token,
                    account,
                    balance: reader.balance_of(token, account)?,
                });
            }
        }
        Ok(GET_MULTI_TOKEN_BALANCES.encode_output(&[token_balances_token(&out)]))
    } else {
        Err(unknown_selector(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::aggregator as agg_abi;

    struct World {
        ledger: Ledger,
        aggregator: Address,
        token: Address,
        a: Address,
        b: Address,
        c: Address,
    }

    fn world() -> World {
        let deployer = Address::repeat_byte(0xd0);
        let (a, b, c) = (
            Address::repeat_byte(0x0a),
            Address::repeat_byte(0x0b),
            Address::repeat_byte(0x0c),
        );
        let mut ledger = Ledger::new();
        let token = ledger.deploy_token(deployer, "Cash", "CASH");
        let aggregator = ledger.deploy_aggregator(deployer);
        for (who, amount) in [(a, 100u64), (b, 200), (c, 300)] {
            ledger
                .call(deployer, token, U256::zero(), &token_abi::mint(who, U256::from(amount)))
                .unwrap();
        }
        World {
            ledger,
            aggregator,
            token,
            a,
            b,
            c,
        }
    }

    fn balances(w: &World, accounts: &[Address]) -> Result<Vec<BalanceData>, Revert> {
        let out = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_balances(w.token, accounts))?;
        agg_abi::decode_balances(&mut GET_BALANCES.decode_output(&out)?)
    }

    #[test]
    fn balances_follow_input_order() {
        let w = world();
        let got = balances(&w, &[w.c, w.a, w.b]).unwrap();
        let amounts: Vec<u64> = got.iter().map(|d| d.balance.as_u64()).collect();
        assert_eq!(amounts, vec![300, 100, 200]);
        assert_eq!(got[0].account, w.c);
    }

    #[test]
    fn specific_allowance_after_approve() {
        let mut w = world();
        w.ledger
            .call(w.a, w.token, U256::zero(), &token_abi::approve(w.b, U256::from(50u64)))
            .unwrap();

        let out = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_specific_allowances(w.token, &[w.a], &[w.b]))
            .unwrap();
        let got = agg_abi::decode_allowances(&mut GET_SPECIFIC_ALLOWANCES.decode_output(&out).unwrap()).unwrap();
        assert_eq!(
            got,
            vec![AllowanceData {
                owner: w.a,
                spender: w.b,
                allowance: U256::from(50u64),
            }]
        );
    }

    #[test]
    fn all_pairs_are_owner_major_without_self() {
        let mut w = world();
        w.ledger
            .call(w.b, w.token, U256::zero(), &token_abi::approve(w.c, U256::from(7u64)))
            .unwrap();

        let out = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_allowances(w.token, &[w.a, w.b, w.c]))
            .unwrap();
        let got = agg_abi::decode_allowances(&mut GET_ALLOWANCES.decode_output(&out).unwrap()).unwrap();
        let pairs: Vec<(Address, Address)> = got.iter().map(|d| (d.owner, d.spender)).collect();
        assert_eq!(
            pairs,
            vec![(w.a, w.b), (w.a, w.c), (w.b, w.a), (w.b, w.c), (w.c, w.a), (w.c, w.b)]
        );
        assert_eq!(got[3].allowance, U256::from(7u64));
    }

    #[test]
    fn balances_and_allowances_together() {
        let w = world();
        let out = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_balances_and_allowances(w.token, &[w.a, w.b]))
            .unwrap();
        let mut args = GET_BALANCES_AND_ALLOWANCES.decode_output(&out).unwrap();
        let balances = agg_abi::decode_balances(&mut args).unwrap();
        let allowances = agg_abi::decode_allowances(&mut args).unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(allowances.len(), 2);
    }

    #[test]
    fn multi_token_is_token_major() {
        let mut w = world();
        let second = w.ledger.deploy_token(Address::repeat_byte(0xd1), "Other", "OTH");
        let out = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_multi_token_balances(&[w.token, second], &[w.a, w.b]))
            .unwrap();
        let got = agg_abi::decode_token_balances(&mut GET_MULTI_TOKEN_BALANCES.decode_output(&out).unwrap()).unwrap();
        let order: Vec<(Address, Address)> = got.iter().map(|d| (d.token, d.account)).collect();
        assert_eq!(order, vec![(w.token, w.a), (w.token, w.b), (second, w.a), (second, w.b)]);
        assert_eq!(got[1].balance, U256::from(200u64));
        assert_eq!(got[2].balance, U256::zero());
    }

    #[test]
    fn repeated_queries_are_identical() {
        let w = world();
        let data = agg_abi::get_balances_and_allowances(w.token, &[w.a, w.b, w.c]);
        let first = w.ledger.static_call(w.a, w.aggregator, &data).unwrap();
        let second = w.ledger.static_call(w.b, w.aggregator, &data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let w = world();
        assert!(matches!(balances(&w, &[]), Err(Revert::InvalidInput(_))));
        assert!(matches!(balances(&w, &[w.a, Address::zero()]), Err(Revert::InvalidInput(_))));

        let zero_token = w
            .ledger
            .static_call(w.a, w.aggregator, &agg_abi::get_balances(Address::zero(), &[w.a]));
        assert!(matches!(zero_token, Err(Revert::InvalidInput(_))));

        let mismatch = w.ledger.static_call(
            w.a,
            w.aggregator,
            &agg_abi::get_specific_allowances(w.token, &[w.a, w.b], &[w.c]),
        );
        assert!(matches!(mismatch, Err(Revert::InvalidInput(_))));
    }

    #[test]
    fn value_sent_to_aggregator_is_refused() {
        let mut w = world();
        w.ledger.fund(w.a, U256::from(10u64));
        let err = w
            .ledger
            .call(w.a, w.aggregator, U256::one(), &agg_abi::get_balances(w.token, &[w.a]))
            .unwrap_err();
        assert_eq!(err, Revert::NonPayable);
        assert_eq!(w.ledger.balance(w.a), U256::from(10u64));
    }
}
