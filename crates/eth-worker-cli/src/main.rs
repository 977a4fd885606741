//! eth-worker CLI - runs the transaction worker and inspects its state.
//!
//! `run` serves JSON requests line by line on stdin and answers on stdout.
//! The other commands work offline against the store snapshot named in the
//! config file.

mod commands;
mod common;
mod output;

use clap::Parser;
use commands::{KeyCommand, RunArgs, TaskCommand, WalletCommand};
use common::GlobalOpts;

/// eth-worker - Execute and supervise EVM transactions.
#[derive(Parser, Debug)]
#[command(name = "eth-worker", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the worker, reading JSON requests from stdin
    Run(RunArgs),

    /// Encryption key management (generate, encrypt a private key)
    #[command(subcommand)]
    Key(KeyCommand),

    /// Wallet management (create, set top-up policy, list)
    #[command(subcommand)]
    Wallet(WalletCommand),

    /// Task inspection (get, list)
    #[command(subcommand)]
    Task(TaskCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    common::init_tracing(&cli.global.log);

    let result = match cli.command {
        Command::Run(args) => args.run(&cli.global).await,
        Command::Key(cmd) => cmd.run(&cli.global),
        Command::Wallet(cmd) => cmd.run(&cli.global),
        Command::Task(cmd) => cmd.run(&cli.global),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}
