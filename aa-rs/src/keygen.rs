use crate::config::{update_config, EntityRaw};
use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug)]
pub struct NewEntity {
    pub id: String,
    pub address: Address,
    /// Where the key was written when it is kept out of the config file.
    pub env_file: Option<PathBuf>,
}

pub fn generate_random_wallet() -> Result<(LocalWallet, String)> {
    let mut rng = OsRng;
    // out-of-range scalars are astronomically rare; retry a few times
    for _ in 0..64 {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            continue;
        }
        let pk_hex = format!("0x{}", hex::encode(bytes));
        if let Ok(wallet) = LocalWallet::from_str(&pk_hex) {
            return Ok((wallet, pk_hex));
        }
    }
    Err(anyhow!(
        "failed to generate a valid random private key after multiple attempts"
    ))
}

/// `SMART_ACCOUNT_KEY_<ID>` with the id upper-cased and non-alphanumerics as `_`.
pub fn key_env_var(id: &str) -> String {
    let suffix: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("SMART_ACCOUNT_KEY_{suffix}")
}

/// Generate a key for `id` and record it in the config file.
///
/// With `secrets_dir` the key goes to `<secrets_dir>/<id>.env` and the config
/// only references it (`env:VAR`); otherwise it is stored inline.
pub fn add_entity(config_path: &Path, id: &str, secrets_dir: Option<&Path>, force: bool) -> Result<NewEntity> {
    if id.is_empty() {
        return Err(anyhow!("entity id must not be empty"));
    }
    let (wallet, pk_hex) = generate_random_wallet()?;
    let address = wallet.address();

    update_config(config_path, |raw| {
        if raw.entities.contains_key(id) && !force {
            return Err(anyhow!("entity {id:?} already exists (pass --force to replace it)"));
        }

        let (private_key, env_file) = match secrets_dir {
            Some(dir) => {
                let var = key_env_var(id);
                let path = dir.join(format!("{id}.env"));
                write_key_env_file(&path, &var, address, &pk_hex)?;
                (format!("env:{var}"), Some(path))
            }
            None => (pk_hex.clone(), None),
        };

        raw.entities.insert(
            id.to_string(),
            EntityRaw {
                private_key,
                address: format!("{address:?}"),
                smart_account: None,
            },
        );
        tracing::info!(entity = id, address = ?address, "entity added to config");

        Ok(NewEntity {
            id: id.to_string(),
            address,
            env_file,
        })
    })
}

fn write_key_env_file(path: &Path, var: &str, owner: Address, private_key_hex: &str) -> Result<()> {
    let contents = format!(
        "# Generated by smart-account-aa keygen\n# DO NOT COMMIT THIS FILE.\nexport {var}={private_key_hex}\n# address {owner:?}\n"
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    // mode() only applies on creation; tighten a pre-existing file too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %path.display(), error = %e, "could not restrict key file permissions");
        }
    }

    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}
