mod bundler;
mod chain;
mod config;
mod demo;
mod encoding;
mod keygen;
mod userop;

use anyhow::{anyhow, Context, Result};
use bundler::BundlerClient;
use chain::{revert_of, ChainClient};
use clap::{Args, Parser, Subcommand};
use config::{load_config, Config, Entity};
use encoding::{fmt_address, fmt_h256, fmt_token_amount, parse_token_amount};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use futures::stream::{self, StreamExt, TryStreamExt};
use smart_account::abi::{account as account_abi, events, factory as factory_abi, token as token_abi};
use smart_account::{create2, Revert};
use std::path::PathBuf;

/// Concurrent direct reads when no aggregator is configured.
const READ_CONCURRENCY: usize = 8;

// In --json mode stdout carries exactly one JSON object; human-readable lines go to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "smart-account-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show an entity's smart account address and whether it has code yet.
    Account(AccountArgs),

    /// Deploy an entity's smart account through the factory (owner EOA pays gas).
    Deploy(DeployArgs),

    /// Owner EOA calls `account.execute(token, 0, transfer(to, amount))`.
    Transfer(TransferArgs),

    /// Build, sign and send a token transfer as an ERC-4337 UserOperation.
    SendOp(SendOpArgs),

    /// Token balances of configured entities (EOA and smart account).
    Balances(BalancesArgs),

    /// Pairwise token allowances between entities' smart accounts.
    Allowances(BalancesArgs),

    /// Generate a new owner key and add it to the config file.
    Keygen(KeygenArgs),

    /// Run the account scenarios on an in-process ledger (no node needed).
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Network + entity config (chainId, rpc, contract addresses, entities).
    #[arg(long, env = "SMART_ACCOUNT_CONFIG", default_value = "config/local.json")]
    config: PathBuf,

    /// Override the chain RPC URL (otherwise uses the config file).
    #[arg(long, env = "SMART_ACCOUNT_RPC_URL")]
    rpc: Option<String>,

    /// Print a single JSON object to stdout; everything else goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Entity id from the config.
    #[arg(long)]
    entity: String,

    /// Salt passed to the factory alongside the owner.
    #[arg(long, default_value_t = 0)]
    salt: u64,

    /// Account creation bytecode (compiler artifact JSON or hex file) to
    /// cross-check the factory's answer with an offline CREATE2 prediction.
    #[arg(long)]
    creation_code: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    entity: String,

    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Entity whose smart account sends the tokens.
    #[arg(long)]
    from: String,

    /// Recipient: entity id (its smart account, else its EOA) or a 0x address.
    #[arg(long)]
    to: String,

    /// Token amount in whole units (decimals are read from the token).
    #[arg(long)]
    amount: String,

    /// Entity that signs the transaction (defaults to the owner). Any other
    /// signer is refused by the account with `NotFromEntryPointOrOwner`.
    #[arg(long)]
    signer: Option<String>,

    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct SendOpArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    from: String,

    #[arg(long)]
    to: String,

    #[arg(long)]
    amount: String,

    #[arg(long, default_value_t = 0)]
    salt: u64,

    /// ERC-4337 bundler endpoint.
    #[arg(long, env = "SMART_ACCOUNT_BUNDLER_URL")]
    bundler: String,

    /// Scale the node gas price by this many basis points (10000 = 1x).
    #[arg(long, default_value_t = 10000, env = "SMART_ACCOUNT_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,

    /// Stop after estimating and signing; nothing is sent.
    #[arg(long)]
    dry_run: bool,

    /// Return as soon as the bundler accepts the operation.
    #[arg(long)]
    no_wait: bool,

    /// Give up waiting for the receipt after this many seconds (0 waits forever).
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct BalancesArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Restrict to these entities (repeatable). Defaults to all.
    #[arg(long = "entity")]
    entities: Vec<String>,

    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct KeygenArgs {
    #[arg(long, env = "SMART_ACCOUNT_CONFIG", default_value = "config/local.json")]
    config: PathBuf,

    /// Id of the new entity.
    #[arg(long)]
    entity: String,

    /// Keep the key out of the config: write it to `<dir>/<entity>.env` and
    /// reference it as `env:SMART_ACCOUNT_KEY_<ENTITY>`.
    #[arg(long)]
    secrets_dir: Option<PathBuf>,

    /// Replace an existing entity with the same id.
    #[arg(long, default_value_t = false)]
    force: bool,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Account creation bytecode to deploy with (defaults to a placeholder).
    #[arg(long)]
    creation_code: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // stdout is reserved for command output
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Deploy(args) => cmd_deploy(args).await,
        Command::Transfer(args) => cmd_transfer(args).await,
        Command::SendOp(args) => cmd_send_op(args).await,
        Command::Balances(args) => cmd_balances(args).await,
        Command::Allowances(args) => cmd_allowances(args).await,
        Command::Keygen(args) => cmd_keygen(args),
        Command::Demo(args) => cmd_demo(args).await,
    }
}

async fn connect(common: &CommonArgs) -> Result<(Config, ChainClient)> {
    let cfg = load_config(&common.config, common.rpc.clone())?;
    let chain = ChainClient::connect(&cfg.rpc_url, cfg.chain_id).await?;
    Ok((cfg, chain))
}

/// Factory-derived account address for `entity` and whether code is there yet.
async fn account_of(chain: &ChainClient, cfg: &Config, entity: &Entity, salt: U256) -> Result<(Address, bool)> {
    let account = chain.factory_address(cfg.factory, entity.address, salt).await?;
    if let Some(recorded) = entity.smart_account {
        if salt.is_zero() && recorded != account {
            tracing::warn!(
                entity = %entity.id,
                recorded = ?recorded,
                factory = ?account,
                "config smartAccount differs from the factory's address"
            );
        }
    }
    let deployed = chain.is_deployed(account).await?;
    Ok((account, deployed))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let entity = cfg.entity(&args.entity)?;
    let salt = U256::from(args.salt);

    let (account, deployed) = account_of(&chain, &cfg, entity, salt).await?;

    let factory_entry_point = chain.factory_entry_point(cfg.factory).await?;
    if factory_entry_point != cfg.entry_point {
        tracing::warn!(
            config = ?cfg.entry_point,
            factory = ?factory_entry_point,
            "factory is bound to a different entry point than the config"
        );
    }

    let offline = match args.creation_code.as_deref() {
        Some(path) => {
            let code = encoding::load_creation_code(path)?;
            Some(create2::predict_account_address(
                cfg.factory,
                factory_entry_point,
                &code,
                entity.address,
                salt,
            ))
        }
        None => None,
    };

    if machine_mode {
        let out = serde_json::json!({
            "entity": entity.id,
            "owner": fmt_address(entity.address),
            "smartAccount": fmt_address(account),
            "isDeployed": deployed,
            "offlinePrediction": offline.map(fmt_address),
            "predictionMatches": offline.map(|p| p == account),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", cfg.chain_id);
    outln!(machine_mode, "entryPoint:     {:?}", cfg.entry_point);
    outln!(machine_mode, "factory:        {:?}", cfg.factory);
    outln!(machine_mode, "owner:          {:?}", entity.address);
    outln!(machine_mode, "smartAccount:   {:?}", account);
    outln!(machine_mode, "deployed:       {}", deployed);
    if let Some(p) = offline {
        outln!(machine_mode, "offline CREATE2: {:?} (matches={})", p, p == account);
        if p != account {
            return Err(anyhow!(
                "offline CREATE2 prediction {p:?} disagrees with factory.getAddress {account:?}"
            ));
        }
    }

    Ok(())
}

async fn cmd_deploy(args: DeployArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let entity = cfg.entity(&args.entity)?;
    let salt = U256::from(args.salt);

    let (account, deployed) = account_of(&chain, &cfg, entity, salt).await?;

    let mut tx_hash: Option<H256> = None;
    let mut created_event = false;
    if deployed {
        outln!(machine_mode, "smart account {:?} already deployed; nothing to do", account);
    } else {
        let receipt = chain
            .send(
                &entity.wallet,
                cfg.factory,
                factory_abi::create_account(entity.address, salt),
            )
            .await
            .context("factory.createAccount failed")?;

        let topic = H256(keccak256(events::SMART_ACCOUNT_CREATED));
        created_event = receipt
            .logs
            .iter()
            .any(|l| l.address == cfg.factory && l.topics.first() == Some(&topic));
        tx_hash = Some(receipt.transaction_hash);

        if !chain.is_deployed(account).await? {
            return Err(anyhow!("createAccount mined but no code at {account:?}"));
        }
        outln!(
            machine_mode,
            "deployed smart account {:?} (tx {:?}, SmartAccountCreated emitted: {})",
            account,
            receipt.transaction_hash,
            created_event
        );
    }

    if machine_mode {
        let out = serde_json::json!({
            "entity": entity.id,
            "smartAccount": fmt_address(account),
            "alreadyDeployed": deployed,
            "txHash": tx_hash.map(fmt_h256),
            "createdEvent": created_event,
        });
        println!("{}", out);
    }

    Ok(())
}

async fn cmd_transfer(args: TransferArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let from = cfg.entity(&args.from)?;
    let signer = match args.signer.as_deref() {
        Some(id) => cfg.entity(id)?,
        None => from,
    };
    let recipient = cfg.resolve_recipient(&args.to)?;

    let (account, deployed) = account_of(&chain, &cfg, from, U256::from(args.salt)).await?;
    if !deployed {
        return Err(anyhow!(
            "smart account {account:?} of {:?} is not deployed (run `deploy` or use `send-op`)",
            from.id
        ));
    }

    let decimals = chain.token_decimals(cfg.token).await?;
    let amount = parse_token_amount(&args.amount, decimals)?;
    let call = account_abi::execute(cfg.token, U256::zero(), token_abi::transfer(recipient, amount));

    // dry-run first so a refusal surfaces with its name instead of a gas estimation failure
    if let Err(err) = chain.call(Some(signer.address), account, call.clone()).await {
        if let Some(revert) = revert_of(&err) {
            if *revert == Revert::NotFromEntryPointOrOwner {
                outln!(
                    machine_mode,
                    "rejected: {} (signer {:?} is neither the owner nor the entry point)",
                    revert,
                    signer.address
                );
            } else {
                outln!(machine_mode, "rejected: {}", revert);
            }
            if machine_mode {
                println!("{}", serde_json::json!({ "ok": false, "revert": revert.to_string() }));
            }
        }
        return Err(err);
    }

    let receipt = chain.send(&signer.wallet, account, call).await?;
    let account_balance = chain.token_balance(cfg.token, account).await?;
    let recipient_balance = chain.token_balance(cfg.token, recipient).await?;

    if machine_mode {
        let out = serde_json::json!({
            "ok": true,
            "txHash": fmt_h256(receipt.transaction_hash),
            "smartAccount": fmt_address(account),
            "recipient": fmt_address(recipient),
            "amount": amount.to_string(),
            "accountBalance": account_balance.to_string(),
            "recipientBalance": recipient_balance.to_string(),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "tx:               {:?}", receipt.transaction_hash);
    outln!(
        machine_mode,
        "smartAccount:     {:?} balance {}",
        account,
        fmt_token_amount(account_balance, decimals)
    );
    outln!(
        machine_mode,
        "recipient:        {:?} balance {}",
        recipient,
        fmt_token_amount(recipient_balance, decimals)
    );
    Ok(())
}

async fn cmd_send_op(args: SendOpArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let from = cfg.entity(&args.from)?;
    let recipient = cfg.resolve_recipient(&args.to)?;
    let salt = U256::from(args.salt);

    let (account, deployed) = account_of(&chain, &cfg, from, salt).await?;
    outln!(machine_mode, "smartAccount: {:?} (deployed={})", account, deployed);

    let decimals = chain.token_decimals(cfg.token).await?;
    let amount = parse_token_amount(&args.amount, decimals)?;
    let call_data = account_abi::execute(cfg.token, U256::zero(), token_abi::transfer(recipient, amount));

    let opts = userop::SendOptions {
        gas_multiplier_bps: args.gas_multiplier_bps,
        dry_run: args.dry_run,
        no_wait: args.no_wait,
        max_wait_seconds: args.max_wait_seconds,
    };
    let op = userop::build_user_op(
        &chain,
        account,
        deployed,
        userop::build_init_code(cfg.factory, from.address, salt),
        call_data,
        &opts,
    )
    .await?;

    let bundler = BundlerClient::new(args.bundler.clone());
    let sent = userop::submit(&bundler, &from.wallet, cfg.entry_point, chain.chain_id(), op, &opts).await?;

    let op_json = encoding::user_op_to_json(&sent.user_op)?;
    if machine_mode {
        let out = serde_json::json!({
            "smartAccount": fmt_address(account),
            "userOp": op_json,
            "userOpHash": fmt_h256(sent.user_op_hash),
            "sent": sent.bundler_hash.is_some(),
            "receipt": sent.receipt,
        });
        println!("{}", out);
    }

    if !sent.user_op.init_code.is_empty() {
        outln!(
            machine_mode,
            "account not deployed yet; initCode {}",
            encoding::fmt_bytes(&sent.user_op.init_code)
        );
    }
    outln!(machine_mode, "\nUserOperation (final):\n{}", serde_json::to_string_pretty(&op_json)?);
    outln!(machine_mode, "\nuserOpHash: {}", fmt_h256(sent.user_op_hash));
    match (&sent.bundler_hash, &sent.receipt) {
        (None, _) => outln!(machine_mode, "\n--dry-run set: not sending user operation."),
        (Some(_), None) => outln!(machine_mode, "--no-wait set: not waiting for receipt."),
        (Some(_), Some(receipt)) => outln!(
            machine_mode,
            "\nUserOp receipt:\n{}",
            serde_json::to_string_pretty(receipt)?
        ),
    }

    Ok(())
}

fn selected<'a>(cfg: &'a Config, ids: &[String]) -> Result<Vec<&'a Entity>> {
    if ids.is_empty() {
        return Ok(cfg.entities.values().collect());
    }
    ids.iter().map(|id| cfg.entity(id)).collect()
}

async fn read_balances(chain: &ChainClient, cfg: &Config, holders: &[Address]) -> Result<Vec<U256>> {
    if let Some(aggregator) = cfg.aggregator {
        let rows = chain.aggregated_balances(aggregator, cfg.token, holders).await?;
        return Ok(rows.into_iter().map(|r| r.balance).collect());
    }

    stream::iter(holders.iter().copied())
        .map(|holder| chain.token_balance(cfg.token, holder))
        .buffered(READ_CONCURRENCY)
        .try_collect()
        .await
}

async fn cmd_balances(args: BalancesArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let salt = U256::from(args.salt);

    let mut rows: Vec<(&str, &'static str, Address)> = Vec::new();
    for entity in selected(&cfg, &args.entities)? {
        let (account, _) = account_of(&chain, &cfg, entity, salt).await?;
        rows.push((entity.id.as_str(), "eoa", entity.address));
        rows.push((entity.id.as_str(), "smartAccount", account));
    }

    let holders: Vec<Address> = rows.iter().map(|r| r.2).collect();
    let balances = read_balances(&chain, &cfg, &holders).await?;
    let decimals = chain.token_decimals(cfg.token).await?;

    if machine_mode {
        let list: Vec<_> = rows
            .iter()
            .zip(&balances)
            .map(|((id, kind, address), balance)| {
                serde_json::json!({
                    "entity": id,
                    "kind": kind,
                    "address": fmt_address(*address),
                    "balance": balance.to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "token": fmt_address(cfg.token), "balances": list }));
    }

    outln!(
        machine_mode,
        "token {:?} (via {})",
        cfg.token,
        if cfg.aggregator.is_some() { "aggregator" } else { "direct reads" }
    );
    for ((id, kind, address), balance) in rows.iter().zip(&balances) {
        outln!(
            machine_mode,
            "{:<12} {:<13} {:?}  {}",
            id,
            kind,
            address,
            fmt_token_amount(*balance, decimals)
        );
    }
    Ok(())
}

async fn cmd_allowances(args: BalancesArgs) -> Result<()> {
    let (cfg, chain) = connect(&args.common).await?;
    let machine_mode = args.common.json;
    let salt = U256::from(args.salt);

    let mut ids = Vec::new();
    let mut accounts = Vec::new();
    for entity in selected(&cfg, &args.entities)? {
        let (account, _) = account_of(&chain, &cfg, entity, salt).await?;
        ids.push(entity.id.as_str());
        accounts.push(account);
    }
    let name_of = |a: Address| {
        accounts
            .iter()
            .position(|x| *x == a)
            .map(|i| ids[i])
            .unwrap_or("?")
    };

    // owner-major, every ordered pair with owner != spender
    let rows: Vec<(Address, Address, U256)> = match cfg.aggregator {
        Some(aggregator) => chain
            .aggregated_allowances(aggregator, cfg.token, &accounts)
            .await?
            .into_iter()
            .map(|r| (r.owner, r.spender, r.allowance))
            .collect(),
        None => {
            let mut pairs = Vec::new();
            for &owner in &accounts {
                for &spender in &accounts {
                    if owner != spender {
                        pairs.push((owner, spender));
                    }
                }
            }
            stream::iter(pairs)
                .map(|(owner, spender)| {
                    let chain = &chain;
                    let token = cfg.token;
                    async move {
                        let allowance = chain.token_allowance(token, owner, spender).await?;
                        Ok::<_, anyhow::Error>((owner, spender, allowance))
                    }
                })
                .buffered(READ_CONCURRENCY)
                .try_collect::<Vec<_>>()
                .await?
        }
    };

    if machine_mode {
        let list: Vec<_> = rows
            .iter()
            .map(|(owner, spender, allowance)| {
                serde_json::json!({
                    "owner": fmt_address(*owner),
                    "spender": fmt_address(*spender),
                    "allowance": allowance.to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "token": fmt_address(cfg.token), "allowances": list }));
    }

    for (owner, spender, allowance) in &rows {
        outln!(
            machine_mode,
            "{:<12} -> {:<12} {}",
            name_of(*owner),
            name_of(*spender),
            allowance
        );
    }
    Ok(())
}

fn cmd_keygen(args: KeygenArgs) -> Result<()> {
    let added = keygen::add_entity(
        &args.config,
        &args.entity,
        args.secrets_dir.as_deref(),
        args.force,
    )?;

    if args.json {
        let out = serde_json::json!({
            "entity": added.id,
            "address": fmt_address(added.address),
            "envPath": added.env_file.as_ref().map(|p| p.display().to_string()),
        });
        println!("{}", out);
    }

    outln!(args.json, "entity:  {}", added.id);
    outln!(args.json, "address: {:?}", added.address);
    if let Some(p) = &added.env_file {
        outln!(args.json, "key saved to {} (source it before using this entity)", p.display());
    }
    Ok(())
}

async fn cmd_demo(args: DemoArgs) -> Result<()> {
    let creation_code = args
        .creation_code
        .as_deref()
        .map(encoding::load_creation_code)
        .transpose()?;

    let report = demo::run(creation_code).await?;

    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    }
    outln!(args.json, "smartAccount: {:?} (owner {:?})", report.smart_account, report.owner);
    for step in &report.steps {
        outln!(
            args.json,
            "[{}] {:<32} {}",
            if step.ok { "ok" } else { "FAIL" },
            step.name,
            step.detail
        );
    }

    if !report.passed() {
        return Err(anyhow!("demo scenarios failed"));
    }
    Ok(())
}
