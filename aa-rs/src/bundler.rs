use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_quantity_value, user_op_to_json};
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smart_account::UserOperation;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// ERC-4337 bundler JSON-RPC client (`eth_*UserOperation*` namespace).
#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await
            .context("eth_supportedEntryPoints failed")?;
        parse_entry_points(&res)
    }

    pub async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op_to_json(op)?, fmt_address(entry_point)]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_estimates(&res)
    }

    pub async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([user_op_to_json(op)?, fmt_address(entry_point)]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Poll `eth_getUserOperationReceipt` until the bundler reports one.
    /// A zero `timeout` waits forever.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let params = serde_json::json!([fmt_h256(user_op_hash)]);

        loop {
            match self.rpc("eth_getUserOperationReceipt", params.clone()).await {
                Ok(receipt) if !receipt.is_null() => return Ok(receipt),
                Ok(_) => tracing::debug!(user_op_hash = ?user_op_hash, "receipt not available yet"),
                // public bundlers flap; keep polling
                Err(e) => tracing::warn!(error = %e, "receipt poll failed"),
            }

            let next = Instant::now() + RECEIPT_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                if next > deadline {
                    return Err(anyhow!(
                        "no receipt for userOp {} within {}s",
                        fmt_h256(user_op_hash),
                        timeout.as_secs()
                    ));
                }
            }
            tokio::time::sleep_until(next).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        tracing::debug!(method, id = request.id, url = %self.url, "bundler request");

        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{method}: POST {} failed", self.url))?;

        let status = resp.status();
        let text = resp.text().await.with_context(|| format!("{method}: reading body failed"))?;
        if !status.is_success() {
            return Err(anyhow!("{method}: HTTP {status}: {text}"));
        }

        let envelope: RpcResponse = serde_json::from_str(&text)
            .with_context(|| format!("{method}: not a JSON-RPC response: {text}"))?;
        if let Some(err) = envelope.error {
            return Err(anyhow!("{method}: {err}"));
        }
        Ok(envelope.result)
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    /// `null` both when absent and when the method has nothing to report yet.
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundler error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates> {
    let field = |key: &str| -> Result<U256> {
        let v = res
            .get(key)
            .ok_or_else(|| anyhow!("gas estimate is missing {key}: {res}"))?;
        parse_quantity_value(v).with_context(|| format!("invalid {key}"))
    };

    Ok(GasEstimates {
        call_gas_limit: field("callGasLimit")?,
        verification_gas_limit: field("verificationGasLimit")?,
        pre_verification_gas: field("preVerificationGas")?,
    })
}

fn parse_entry_points(res: &Value) -> Result<Vec<Address>> {
    res.as_array()
        .ok_or_else(|| anyhow!("expected an array of entry points, got {res}"))?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| anyhow!("entry point is not a string: {v}"))?
                .parse::<Address>()
                .map_err(|e| anyhow!("invalid entry point address: {e}"))
        })
        .collect()
}

/// Plain string per ERC-4337; some providers wrap it in an object.
fn parse_userop_hash(res: &Value) -> Result<H256> {
    let hash = match res.as_str() {
        Some(s) => s,
        None => ["result", "userOpHash", "userOperationHash"]
            .iter()
            .find_map(|key| res.get(*key).and_then(Value::as_str))
            .ok_or_else(|| anyhow!("userOp hash missing from eth_sendUserOperation result: {res}"))?,
    };
    parse_h256(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn userop_hash_from_string() {
        let hash = parse_userop_hash(&json!(HASH)).unwrap();
        assert_eq!(hash, parse_h256(HASH).unwrap());
    }

    #[test]
    fn userop_hash_from_wrapped_objects() {
        for key in ["result", "userOpHash", "userOperationHash"] {
            let hash = parse_userop_hash(&json!({ key: HASH })).unwrap();
            assert_eq!(hash, parse_h256(HASH).unwrap(), "wrapped in {key}");
        }
    }

    #[test]
    fn userop_hash_rejects_unknown_shape() {
        assert!(parse_userop_hash(&json!({ "foo": "bar" })).is_err());
        assert!(parse_userop_hash(&json!("0x1234")).is_err());
    }

    #[test]
    fn gas_estimates_accept_mixed_encodings() {
        let res = json!({
            "callGasLimit": "0x5208",
            "verificationGasLimit": 150000,
            "preVerificationGas": "0xc350",
        });
        let est = parse_gas_estimates(&res).unwrap();
        assert_eq!(est.call_gas_limit, U256::from(21_000u64));
        assert_eq!(est.verification_gas_limit, U256::from(150_000u64));
        assert_eq!(est.pre_verification_gas, U256::from(50_000u64));
    }

    #[test]
    fn gas_estimates_require_every_field() {
        let res = json!({ "callGasLimit": "0x1", "verificationGasLimit": "0x1" });
        let err = parse_gas_estimates(&res).unwrap_err();
        assert!(err.to_string().contains("preVerificationGas"));
    }

    #[test]
    fn rpc_envelopes() {
        let ok: RpcResponse = serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "result": null })).unwrap();
        assert!(ok.error.is_none());
        assert!(ok.result.is_null());

        let failed: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": { "code": -32500, "message": "AA23 reverted", "data": "0x" }
        }))
        .unwrap();
        let msg = failed.error.unwrap().to_string();
        assert!(msg.contains("-32500") && msg.contains("AA23 reverted"));
    }

    #[test]
    fn entry_points_parse() {
        let res = json!(["0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"]);
        let eps = parse_entry_points(&res).unwrap();
        assert_eq!(eps.len(), 1);
        assert!(parse_entry_points(&json!("nope")).is_err());
    }
}
