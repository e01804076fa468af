//! JSON-RPC access to the deployed contracts.
//!
//! Calldata is built and return data decoded with `smart_account::abi`, the
//! same declarations the in-process ledger dispatches on. Revert data coming
//! back from the node is decoded into [`Revert`] so callers can match on the
//! named error.

use anyhow::{anyhow, Context, Result};
use ethers::prelude::*;
use ethers::providers::MiddlewareError;
use ethers::types::transaction::eip2718::TypedTransaction;
use smart_account::abi::{account as account_abi, aggregator as agg_abi, factory as factory_abi, token as token_abi};
use smart_account::{AllowanceData, BalanceData, Revert};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChainClient {
    provider: Provider<Http>,
    chain_id: u64,
}

impl ChainClient {
    /// Connects and checks the node serves `expected_chain_id`.
    pub async fn connect(rpc_url: &str, expected_chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("invalid RPC url {rpc_url}"))?
            .interval(Duration::from_millis(350));

        let chain_id = provider
            .get_chainid()
            .await
            .context("eth_chainId failed")?
            .as_u64();
        if chain_id != expected_chain_id {
            return Err(anyhow!(
                "chainId mismatch: config has {}, RPC returned {}",
                expected_chain_id,
                chain_id
            ));
        }

        Ok(Self { provider, chain_id })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn is_deployed(&self, address: Address) -> Result<bool> {
        let code = self
            .provider
            .get_code(address, None)
            .await
            .context("eth_getCode failed")?;
        Ok(!code.as_ref().is_empty())
    }

    pub async fn gas_price(&self) -> Result<U256> {
        self.provider
            .get_gas_price()
            .await
            .context("failed to fetch gas price")
    }

    /// `eth_call`. A revert comes back as an error wrapping the decoded [`Revert`].
    pub async fn call(&self, from: Option<Address>, to: Address, data: Bytes) -> Result<Bytes> {
        let mut req = TransactionRequest::new().to(to).data(data);
        if let Some(from) = from {
            req = req.from(from);
        }
        let tx: TypedTransaction = req.into();

        self.provider
            .call(&tx, None)
            .await
            .map_err(|e| rpc_error(e, format!("eth_call to {to:?}")))
    }

    /// Signs and sends a transaction from `wallet`, waiting for the receipt.
    pub async fn send(&self, wallet: &LocalWallet, to: Address, data: Bytes) -> Result<TransactionReceipt> {
        let client = SignerMiddleware::new(
            self.provider.clone(),
            wallet.clone().with_chain_id(self.chain_id),
        );
        let tx = TransactionRequest::new().to(to).data(data);

        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| rpc_error(e, format!("transaction to {to:?}")))?;
        let tx_hash = pending.tx_hash();
        tracing::info!(from = ?wallet.address(), to = ?to, tx = ?tx_hash, "transaction sent");

        let receipt = pending
            .await
            .context("failed waiting for transaction receipt")?
            .ok_or_else(|| anyhow!("transaction {tx_hash:?} dropped from mempool"))?;
        if receipt.status != Some(U64::one()) {
            return Err(anyhow!("transaction {tx_hash:?} reverted on-chain"));
        }
        Ok(receipt)
    }

    pub async fn factory_address(&self, factory: Address, owner: Address, salt: U256) -> Result<Address> {
        let out = self
            .call(None, factory, factory_abi::get_address(owner, salt))
            .await
            .context("factory.getAddress failed")?;
        Ok(factory_abi::GET_ADDRESS.decode_output(&out)?.address()?)
    }

    pub async fn factory_entry_point(&self, factory: Address) -> Result<Address> {
        let out = self
            .call(None, factory, factory_abi::GET_ENTRY_POINT.encode_call(&[]))
            .await
            .context("factory.getEntryPoint failed")?;
        Ok(factory_abi::GET_ENTRY_POINT.decode_output(&out)?.address()?)
    }

    pub async fn account_nonce(&self, account: Address) -> Result<U256> {
        let out = self
            .call(None, account, account_abi::GET_NONCE.encode_call(&[]))
            .await
            .context("account.getNonce failed")?;
        Ok(account_abi::GET_NONCE.decode_output(&out)?.uint()?)
    }

    pub async fn token_decimals(&self, token: Address) -> Result<u8> {
        let out = self
            .call(None, token, token_abi::DECIMALS.encode_call(&[]))
            .await
            .context("token.decimals failed")?;
        let decimals = token_abi::DECIMALS.decode_output(&out)?.uint()?;
        if decimals > U256::from(u8::MAX) {
            return Err(anyhow!("token reports {decimals} decimals"));
        }
        Ok(decimals.low_u32() as u8)
    }

    pub async fn token_balance(&self, token: Address, holder: Address) -> Result<U256> {
        let out = self
            .call(None, token, token_abi::balance_of(holder))
            .await
            .with_context(|| format!("balanceOf({holder:?}) failed"))?;
        Ok(token_abi::BALANCE_OF.decode_output(&out)?.uint()?)
    }

    pub async fn token_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        let out = self
            .call(None, token, token_abi::allowance(owner, spender))
            .await
            .with_context(|| format!("allowance({owner:?}, {spender:?}) failed"))?;
        Ok(token_abi::ALLOWANCE.decode_output(&out)?.uint()?)
    }

    pub async fn aggregated_balances(
        &self,
        aggregator: Address,
        token: Address,
        accounts: &[Address],
    ) -> Result<Vec<BalanceData>> {
        let out = self
            .call(None, aggregator, agg_abi::get_balances(token, accounts))
            .await
            .context("aggregator.getBalances failed")?;
        Ok(agg_abi::decode_balances(&mut agg_abi::GET_BALANCES.decode_output(&out)?)?)
    }

    pub async fn aggregated_allowances(
        &self,
        aggregator: Address,
        token: Address,
        accounts: &[Address],
    ) -> Result<Vec<AllowanceData>> {
        let out = self
            .call(None, aggregator, agg_abi::get_allowances(token, accounts))
            .await
            .context("aggregator.getAllowances failed")?;
        Ok(agg_abi::decode_allowances(&mut agg_abi::GET_ALLOWANCES.decode_output(&out)?)?)
    }
}

/// Revert carried by a node error, if the node returned revert data.
pub fn decode_revert<E: MiddlewareError>(err: &E) -> Option<Revert> {
    let data = err.as_error_response()?.as_revert_data()?;
    Some(Revert::decode(&data))
}

fn rpc_error<E: MiddlewareError + 'static>(err: E, what: String) -> anyhow::Error {
    match decode_revert(&err) {
        Some(revert) => {
            tracing::warn!(error = %revert, "{what} reverted");
            anyhow::Error::new(revert).context(format!("{what} reverted"))
        }
        None => anyhow::Error::new(err).context(format!("{what} failed")),
    }
}

/// The named [`Revert`] inside an error chain built by this module.
pub fn revert_of(err: &anyhow::Error) -> Option<&Revert> {
    err.downcast_ref::<Revert>()
}
