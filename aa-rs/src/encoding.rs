use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{format_units, parse_units};
use smart_account::UserOperation;
use std::fs;
use std::path::Path;

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// Bundler wire shape of a UserOperation (hex quantities, camelCase keys).
pub fn user_op_to_json(op: &UserOperation) -> Result<serde_json::Value> {
    serde_json::to_value(op).context("failed to serialize UserOperation")
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

/// Quantity field that some bundlers return as hex string and others as a JSON number.
pub fn parse_quantity_value(v: &serde_json::Value) -> Result<U256> {
    match v {
        serde_json::Value::String(s) => parse_u256_quantity(s),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| anyhow!("quantity {n} is not an unsigned integer")),
        other => Err(anyhow!("expected quantity, got {other}")),
    }
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

/// Decimal token amount ("1.5") to base units.
pub fn parse_token_amount(s: &str, decimals: u8) -> Result<U256> {
    let units = parse_units(s, u32::from(decimals))
        .with_context(|| format!("invalid amount {s:?} for {decimals} decimals"))?;
    Ok(units.into())
}

pub fn fmt_token_amount(v: U256, decimals: u8) -> String {
    format_units(v, u32::from(decimals)).unwrap_or_else(|_| v.to_string())
}

/// Account creation bytecode from a compiler artifact (`{"bytecode": "0x..."}`,
/// or Foundry's `{"bytecode": {"object": "0x..."}}`) or a bare hex file.
pub fn load_creation_code(path: &Path) -> Result<Bytes> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read creation code at {}", path.display()))?;
    let trimmed = raw.trim();

    let hex_str = if trimmed.starts_with('{') {
        let artifact: serde_json::Value = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse artifact {}", path.display()))?;
        let bytecode = &artifact["bytecode"];
        bytecode
            .as_str()
            .or_else(|| bytecode["object"].as_str())
            .ok_or_else(|| anyhow!("artifact {} has no bytecode field", path.display()))?
            .to_string()
    } else {
        trimmed.to_string()
    };

    let code = hex::decode(hex_str.strip_prefix("0x").unwrap_or(&hex_str))
        .with_context(|| format!("creation code in {} is not hex", path.display()))?;
    if code.is_empty() {
        return Err(anyhow!("creation code in {} is empty", path.display()));
    }
    Ok(Bytes::from(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities_accept_hex_and_numbers() {
        assert_eq!(parse_quantity_value(&json!("0x10")).unwrap(), U256::from(16u64));
        assert_eq!(parse_quantity_value(&json!(21000)).unwrap(), U256::from(21000u64));
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert!(parse_quantity_value(&json!(null)).is_err());
    }

    #[test]
    fn token_amounts_use_decimals() {
        assert_eq!(
            parse_token_amount("1.5", 18).unwrap(),
            U256::from(1_500_000_000_000_000_000u64)
        );
        assert_eq!(parse_token_amount("7", 0).unwrap(), U256::from(7u64));
        assert!(parse_token_amount("abc", 18).is_err());
        assert_eq!(fmt_token_amount(U256::from(25u64), 1), "2.5");
    }

    #[test]
    fn creation_code_from_artifacts() {
        let dir = std::env::temp_dir().join(format!("smart-account-aa-enc-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let hardhat = dir.join("hardhat.json");
        fs::write(&hardhat, r#"{"contractName":"SmartAccount","bytecode":"0x6080"}"#).unwrap();
        assert_eq!(load_creation_code(&hardhat).unwrap(), Bytes::from(vec![0x60, 0x80]));

        let foundry = dir.join("foundry.json");
        fs::write(&foundry, r#"{"bytecode":{"object":"0x6040"}}"#).unwrap();
        assert_eq!(load_creation_code(&foundry).unwrap(), Bytes::from(vec![0x60, 0x40]));

        let bare = dir.join("code.hex");
        fs::write(&bare, "6080\n").unwrap();
        assert_eq!(load_creation_code(&bare).unwrap(), Bytes::from(vec![0x60, 0x80]));

        let empty = dir.join("empty.hex");
        fs::write(&empty, "0x").unwrap();
        assert!(load_creation_code(&empty).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn user_op_json_is_bundler_shaped() {
        let op = UserOperation {
            nonce: U256::from(1u64),
            ..Default::default()
        };
        let v = user_op_to_json(&op).unwrap();
        assert_eq!(v["nonce"], "0x1");
        assert_eq!(v["initCode"], "0x");
        assert_eq!(v["sender"], fmt_address(Address::zero()));
    }
}
