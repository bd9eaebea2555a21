//! Command-line interface.

mod check;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use self::check::run_check_command;

#[derive(Parser, Debug)]
#[command(name = "tonpixo")]
#[command(about = "Chat with a TON blockchain analysis backend", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML config file (defaults to ~/.tonpixo/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to analyze as soon as the session starts
    #[arg(long, value_name = "ADDR")]
    pub address: Option<String>,

    /// Start a new conversation instead of resuming the last one
    #[arg(long)]
    pub new: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check configuration and backend reachability
    Check {
        /// Seconds to wait for the backend
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}
