//! Encryption key commands.

use crate::common::GlobalOpts;
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use eth_worker::wallet::parse_private_key;
use eth_worker::{KeyCipher, TopupPolicy, Wallet};

/// Encryption key commands.
#[derive(clap::Subcommand, Debug)]
pub enum KeyCommand {
    /// Generate a new base64 AES-256 key for `encryption_key`
    Generate,
    /// Encrypt a private key for the `encrypted_private_key` request field
    Encrypt(EncryptArgs),
}

#[derive(Args, Debug)]
pub struct EncryptArgs {
    /// Private key hex
    #[arg(long, env = "ETH_WORKER_PRIVATE_KEY")]
    private_key: String,
}

impl KeyCommand {
    pub fn run(&self, global: &GlobalOpts) -> Result<()> {
        match self {
            KeyCommand::Generate => cmd_generate(global),
            KeyCommand::Encrypt(args) => cmd_encrypt(args, global),
        }
    }
}

fn cmd_generate(global: &GlobalOpts) -> Result<()> {
    let key = KeyCipher::generate_key();
    if global.json {
        output::print_json(&serde_json::json!({ "encryption_key": key }))?;
    } else {
        output::print_header("Generated Encryption Key");
        output::print_kv("Key", &key);
    }
    Ok(())
}

fn cmd_encrypt(args: &EncryptArgs, global: &GlobalOpts) -> Result<()> {
    let config = global.load_config()?;
    let cipher = config.key_cipher().context("invalid encryption key")?;
    let signer = parse_private_key(&args.private_key).context("invalid private key")?;
    let wallet = Wallet::from_private_key(0, &signer, &cipher, TopupPolicy::default())?;

    if global.json {
        output::print_json(&serde_json::json!({
            "address": wallet.address.to_string(),
            "encrypted_private_key": wallet.encrypted_private_key,
        }))?;
    } else {
        output::print_header("Encrypted Private Key");
        output::print_kv("Address", &wallet.address.to_string());
        output::print_kv("Encrypted", &wallet.encrypted_private_key);
    }
    Ok(())
}
