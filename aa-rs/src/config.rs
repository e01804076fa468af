use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::{env, str::FromStr};

/// Prefix marking a private key that lives in an environment variable.
const ENV_PREFIX: &str = "env:";

/// On-disk shape of the network/entity config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityRaw>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRaw {
    /// Hex key, or `env:VAR`.
    pub private_key: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_account: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub wallet: LocalWallet,
    pub address: Address,
    pub smart_account: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub factory: Address,
    pub token: Address,
    pub aggregator: Option<Address>,
    pub entities: BTreeMap<String, Entity>,
}

impl Config {
    pub fn entity(&self, id: &str) -> Result<&Entity> {
        self.entities.get(id).ok_or_else(|| {
            let known: Vec<&str> = self.entities.keys().map(String::as_str).collect();
            anyhow!("unknown entity {id:?} (known: {})", known.join(", "))
        })
    }

    /// An entity id resolves to its smart account (or EOA when none is recorded);
    /// anything else must be a literal address.
    pub fn resolve_recipient(&self, who: &str) -> Result<Address> {
        if let Some(e) = self.entities.get(who) {
            return Ok(e.smart_account.unwrap_or(e.address));
        }
        parse_addr(who).with_context(|| format!("{who:?} is neither an entity id nor an address"))
    }
}

pub fn read_raw(path: &Path) -> Result<ConfigRaw> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config json at {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config json at {}", path.display()))
}

pub fn load_config(path: &Path, rpc_override: Option<String>) -> Result<Config> {
    let raw = read_raw(path)?;

    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.as_deref() {
        env::var(env_var).unwrap_or_else(|_| raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    if raw.entities.is_empty() {
        return Err(anyhow!("config {} defines no entities", path.display()));
    }

    let mut entities = BTreeMap::new();
    for (id, e) in &raw.entities {
        let entity = resolve_entity(id, e, raw.chain_id)
            .with_context(|| format!("invalid entity {id:?} in {}", path.display()))?;
        entities.insert(id.clone(), entity);
    }

    Ok(Config {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point: parse_addr(&raw.entry_point).context("invalid entryPoint address")?,
        factory: parse_addr(&raw.factory).context("invalid factory address")?,
        token: parse_addr(&raw.token).context("invalid token address")?,
        aggregator: raw
            .aggregator
            .as_deref()
            .map(parse_addr)
            .transpose()
            .context("invalid aggregator address")?,
        entities,
    })
}

fn resolve_entity(id: &str, raw: &EntityRaw, chain_id: u64) -> Result<Entity> {
    let key = match raw.private_key.strip_prefix(ENV_PREFIX) {
        Some(var) => env::var(var).with_context(|| format!("environment variable {var} is not set"))?,
        None => raw.private_key.clone(),
    };
    let wallet = LocalWallet::from_str(key.trim())
        .context("invalid private key")?
        .with_chain_id(chain_id);

    let address = parse_addr(&raw.address).context("invalid address")?;
    if wallet.address() != address {
        return Err(anyhow!(
            "private key belongs to {:?}, not the configured address {:?}",
            wallet.address(),
            address
        ));
    }

    let smart_account = raw
        .smart_account
        .as_deref()
        .map(parse_addr)
        .transpose()
        .context("invalid smartAccount address")?;

    Ok(Entity {
        id: id.to_string(),
        wallet,
        address,
        smart_account,
    })
}

/// Rewrite the config file under an exclusive lock, applying `edit` to the
/// freshly read contents. The new file replaces the old one by rename.
pub fn update_config<T>(path: &Path, edit: impl FnOnce(&mut ConfigRaw) -> Result<T>) -> Result<T> {
    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .with_context(|| format!("config is being modified by another process ({})", lock_path.display()))?;

    let mut raw = read_raw(path)?;
    let out = edit(&mut raw)?;

    let json = serde_json::to_string_pretty(&raw).context("failed to serialize config")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json + "\n")
        .with_context(|| format!("failed to write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace config {}", path.display()))?;

    // best effort; the lock also goes away when the handle is dropped
    let _ = lock_file.unlock();
    Ok(out)
}

pub fn parse_addr(s: &str) -> Result<Address> {
    s.trim().parse::<Address>().map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // well-known dev keys
    const KEY_A: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDR_A: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const KEY_B: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const ADDR_B: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn write_config(name: &str, entities: serde_json::Value) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("smart-account-aa-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.json"));
        let cfg = serde_json::json!({
            "chainId": 31337,
            "rpc": "http://127.0.0.1:8545",
            "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "factory": "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0",
            "token": "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9",
            "entities": entities,
        });
        fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_entities_and_addresses() {
        let path = write_config(
            "basic",
            serde_json::json!({
                "alice": { "privateKey": KEY_A, "address": ADDR_A },
                "bob": {
                    "privateKey": KEY_B,
                    "address": ADDR_B,
                    "smartAccount": "0x00000000000000000000000000000000000000bb"
                },
            }),
        );
        let cfg = load_config(&path, None).unwrap();
        assert_eq!(cfg.chain_id, 31337);
        assert_eq!(cfg.aggregator, None);
        assert_eq!(cfg.entity("alice").unwrap().address, parse_addr(ADDR_A).unwrap());
        assert_eq!(cfg.entity("alice").unwrap().wallet.chain_id(), 31337);
        assert!(cfg.entity("carol").is_err());

        // recipients: entity -> smart account if known, else EOA; or a literal address
        assert_eq!(cfg.resolve_recipient("alice").unwrap(), parse_addr(ADDR_A).unwrap());
        assert_eq!(
            cfg.resolve_recipient("bob").unwrap(),
            parse_addr("0x00000000000000000000000000000000000000bb").unwrap()
        );
        assert!(cfg.resolve_recipient("nobody").is_err());
    }

    #[test]
    fn rpc_override_wins() {
        let path = write_config(
            "rpc",
            serde_json::json!({ "alice": { "privateKey": KEY_A, "address": ADDR_A } }),
        );
        let cfg = load_config(&path, Some("http://node:8545".into())).unwrap();
        assert_eq!(cfg.rpc_url, "http://node:8545");
    }

    #[test]
    fn private_key_from_environment() {
        env::set_var("SMART_ACCOUNT_AA_TEST_KEY_B", KEY_B);
        let path = write_config(
            "envkey",
            serde_json::json!({
                "bob": { "privateKey": "env:SMART_ACCOUNT_AA_TEST_KEY_B", "address": ADDR_B }
            }),
        );
        let cfg = load_config(&path, None).unwrap();
        assert_eq!(cfg.entity("bob").unwrap().wallet.address(), parse_addr(ADDR_B).unwrap());

        let missing = write_config(
            "envmissing",
            serde_json::json!({
                "bob": { "privateKey": "env:SMART_ACCOUNT_AA_TEST_UNSET", "address": ADDR_B }
            }),
        );
        assert!(load_config(&missing, None).is_err());
    }

    #[test]
    fn key_address_mismatch_is_rejected() {
        let path = write_config(
            "mismatch",
            serde_json::json!({ "alice": { "privateKey": KEY_A, "address": ADDR_B } }),
        );
        let err = load_config(&path, None).unwrap_err();
        assert!(format!("{err:#}").contains("not the configured address"));
    }

    #[test]
    fn empty_entity_set_is_rejected() {
        let path = write_config("empty", serde_json::json!({}));
        assert!(load_config(&path, None).is_err());
    }

    #[test]
    fn update_rewrites_and_keeps_other_entities() {
        let path = write_config(
            "update",
            serde_json::json!({ "alice": { "privateKey": "env:ALICE_KEY", "address": ADDR_A } }),
        );
        update_config(&path, |raw| {
            raw.entities.insert(
                "bob".into(),
                EntityRaw {
                    private_key: KEY_B.into(),
                    address: ADDR_B.into(),
                    smart_account: None,
                },
            );
            Ok(())
        })
        .unwrap();

        let raw = read_raw(&path).unwrap();
        assert_eq!(raw.entities.len(), 2);
        // env references are written back untouched
        assert_eq!(raw.entities["alice"].private_key, "env:ALICE_KEY");
        assert!(!path.with_extension("json.tmp").exists());
    }
}
