//! Wallet commands. These edit the store snapshot directly; run them while
//! the worker is stopped.

use crate::common::{self, GlobalOpts};
use crate::output;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use clap::Args;
use eth_worker::{TopupPolicy, Wallet};

/// Wallet commands.
#[derive(clap::Subcommand, Debug)]
pub enum WalletCommand {
    /// Create a wallet from a private key, or a random one
    Create(CreateArgs),
    /// Set the balance levels that trigger automatic top-ups
    SetTopup(SetTopupArgs),
    /// List known wallets
    List,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Private key hex. A random key is generated when omitted.
    #[arg(long, env = "ETH_WORKER_PRIVATE_KEY")]
    private_key: Option<String>,

    /// Return the existing wallet instead of failing when it is known
    #[arg(long, default_value_t = false)]
    allow_existing: bool,
}

#[derive(Args, Debug)]
pub struct SetTopupArgs {
    /// Wallet address
    #[arg(long)]
    address: String,

    /// Balance to refill to, in wei
    #[arg(long)]
    target_balance: String,

    /// Refill once the balance is at or below this, in wei
    #[arg(long)]
    threshold: String,
}

impl WalletCommand {
    pub fn run(&self, global: &GlobalOpts) -> Result<()> {
        match self {
            WalletCommand::Create(args) => cmd_create(args, global),
            WalletCommand::SetTopup(args) => cmd_set_topup(args, global),
            WalletCommand::List => cmd_list(global),
        }
    }
}

fn cmd_create(args: &CreateArgs, global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let (store, path) = common::open_snapshot(&config)?;
    let wallets = common::wallet_store(&config, store.clone())?;
    let wallet = wallets.create_wallet(
        args.private_key.as_deref(),
        args.allow_existing,
        TopupPolicy::default(),
    )?;
    common::save_snapshot(&store, &path)?;
    print_wallet(&wallet, global)
}

fn cmd_set_topup(args: &SetTopupArgs, global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let (store, path) = common::open_snapshot(&config)?;
    let wallets = common::wallet_store(&config, store.clone())?;
    let address: Address = args.address.parse().context("invalid address")?;
    let target: U256 = args.target_balance.parse().context("invalid target balance")?;
    let threshold: U256 = args.threshold.parse().context("invalid threshold")?;
    let wallet = wallets.set_topup_policy(&address, target, threshold)?;
    common::save_snapshot(&store, &path)?;
    print_wallet(&wallet, global)
}

fn cmd_list(global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let (store, _) = common::open_snapshot(&config)?;
    let wallets = store.wallets();
    if global.json {
        let rows: Vec<_> = wallets
            .iter()
            .map(|w| {
                serde_json::json!({
                    "id": w.id,
                    "address": w.address.to_string(),
                    "topup": w.topup,
                })
            })
            .collect();
        return output::print_json(&rows);
    }
    output::print_header("Wallets");
    for wallet in &wallets {
        output::print_kv(&wallet.id.to_string(), &wallet.address.to_string());
    }
    Ok(())
}

fn print_wallet(wallet: &Wallet, global: &GlobalOpts) -> Result<()> {
    if global.json {
        output::print_json(&serde_json::json!({
            "id": wallet.id,
            "address": wallet.address.to_string(),
            "topup": wallet.topup,
        }))?;
    } else {
        output::print_success(&format!("wallet {} ready", wallet.id));
        output::print_kv("Address", &wallet.address.to_string());
        output::print_kv("Target balance", &wallet.topup.target_balance.to_string());
        output::print_kv("Top-up threshold", &wallet.topup.topup_threshold.to_string());
    }
    Ok(())
}
