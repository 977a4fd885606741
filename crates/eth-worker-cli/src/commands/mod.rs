//! CLI command implementations.

pub mod key;
pub mod run;
pub mod task;
pub mod wallet;

pub use key::KeyCommand;
pub use run::RunArgs;
pub use task::TaskCommand;
pub use wallet::WalletCommand;
