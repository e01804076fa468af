use crate::bundler::BundlerClient;
use crate::chain::ChainClient;
use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;
use smart_account::abi::factory as factory_abi;
use smart_account::UserOperation;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SendOptions {
    pub gas_multiplier_bps: u64,
    pub dry_run: bool,
    pub no_wait: bool,
    pub max_wait_seconds: u64,
}

#[derive(Debug)]
pub struct Submitted {
    pub user_op: UserOperation,
    pub user_op_hash: H256,
    /// Bundler hash; `None` on a dry run.
    pub bundler_hash: Option<H256>,
    pub receipt: Option<Value>,
}

/// `initCode` for an undeployed account: factory address followed by
/// `createAccount(owner, salt)` calldata.
pub fn build_init_code(factory: Address, owner: Address, salt: U256) -> Bytes {
    let create = factory_abi::create_account(owner, salt);
    let mut v = Vec::with_capacity(20 + create.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create.as_ref());
    Bytes::from(v)
}

/// Hash locally and sign with the owner's EIP-191 personal-sign signature.
pub async fn sign_user_op(
    op: &mut UserOperation,
    wallet: &LocalWallet,
    entry_point: Address,
    chain_id: u64,
) -> Result<H256> {
    let hash = op.hash(entry_point, chain_id);
    let sig = wallet
        .sign_message(hash.as_bytes())
        .await
        .context("failed to sign userOpHash")?;
    op.signature = Bytes::from(sig.to_vec());
    Ok(hash)
}

/// `gas_price` scaled by `opts.gas_multiplier_bps` (a multiplier of 0 counts as 1 bps).
pub fn scaled_gas_price(gas_price: U256, opts: &SendOptions) -> U256 {
    let bps = opts.gas_multiplier_bps.max(1);
    gas_price * U256::from(bps) / U256::from(10_000u64)
}

/// Build a UserOperation for `account`, reading its nonce fresh from the chain.
pub async fn build_user_op(
    chain: &ChainClient,
    account: Address,
    deployed: bool,
    init_code: Bytes,
    call_data: Bytes,
    opts: &SendOptions,
) -> Result<UserOperation> {
    let nonce = if deployed {
        chain.account_nonce(account).await?
    } else {
        U256::zero()
    };

    let gas_price = chain.gas_price().await?;
    let max_fee_per_gas = scaled_gas_price(gas_price, opts);
    if opts.gas_multiplier_bps != 10_000 {
        tracing::info!(bps = opts.gas_multiplier_bps, max_fee_per_gas = %max_fee_per_gas, "gas multiplier applied");
    }

    Ok(UserOperation {
        sender: account,
        nonce,
        init_code: if deployed { Bytes::default() } else { init_code },
        call_data,
        // zero until the bundler estimates them
        call_gas_limit: U256::zero(),
        verification_gas_limit: U256::zero(),
        pre_verification_gas: U256::zero(),
        max_fee_per_gas,
        max_priority_fee_per_gas: max_fee_per_gas,
        paymaster_and_data: Bytes::default(),
        signature: Bytes::from(vec![0u8; 65]),
    })
}

/// Sign, estimate, re-sign with the estimated limits, send, and (unless told
/// not to) wait for the receipt.
pub async fn submit(
    bundler: &BundlerClient,
    wallet: &LocalWallet,
    entry_point: Address,
    chain_id: u64,
    mut op: UserOperation,
    opts: &SendOptions,
) -> Result<Submitted> {
    match bundler.supported_entry_points().await {
        Ok(eps) if !eps.contains(&entry_point) => {
            return Err(anyhow!(
                "bundler does not support entry point {entry_point:?} (supports {eps:?})"
            ));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "could not list bundler entry points"),
    }

    // estimation simulates validation, which needs a real signature
    sign_user_op(&mut op, wallet, entry_point, chain_id).await?;
    let est = bundler
        .estimate_user_operation_gas(&op, entry_point)
        .await
        .context("bundler gas estimate failed")?;
    op.call_gas_limit = est.call_gas_limit;
    op.verification_gas_limit = est.verification_gas_limit;
    op.pre_verification_gas = est.pre_verification_gas;

    let user_op_hash = sign_user_op(&mut op, wallet, entry_point, chain_id).await?;
    tracing::info!(sender = ?op.sender, nonce = %op.nonce, user_op_hash = ?user_op_hash, "user operation signed");

    if opts.dry_run {
        return Ok(Submitted {
            user_op: op,
            user_op_hash,
            bundler_hash: None,
            receipt: None,
        });
    }

    let bundler_hash = bundler
        .send_user_operation(&op, entry_point)
        .await
        .context("bundler send failed")?;
    if bundler_hash != user_op_hash {
        tracing::warn!(local = ?user_op_hash, bundler = ?bundler_hash, "bundler reported a different userOpHash");
    }

    let receipt = if opts.no_wait {
        None
    } else {
        let receipt = bundler
            .wait_user_operation_receipt(bundler_hash, Duration::from_secs(opts.max_wait_seconds))
            .await
            .context("failed waiting for userOp receipt")?;
        ensure_succeeded(bundler_hash, &receipt)?;
        Some(receipt)
    };

    Ok(Submitted {
        user_op: op,
        user_op_hash,
        bundler_hash: Some(bundler_hash),
        receipt,
    })
}

/// A mined UserOperation whose `callData` reverted still has a receipt; its
/// `success` flag is false and `reason` carries the revert.
pub fn ensure_succeeded(user_op_hash: H256, receipt: &Value) -> Result<()> {
    match receipt.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        Some(false) => {
            let reason = receipt
                .get("reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or("no reason given");
            Err(anyhow!(
                "userOp {user_op_hash:?} was included but its execution reverted: {reason}"
            ))
        }
        None => Err(anyhow!(
            "userOp {user_op_hash:?} receipt has no success flag: {receipt}"
        )),
    }
}
