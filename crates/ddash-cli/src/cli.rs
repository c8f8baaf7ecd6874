//! CLI argument definitions for ddash
//!
//! Uses clap for argument parsing.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Default per-project config file, relative to the working directory.
pub const DEFAULT_CONFIG: &str = ".ddash.json";

/// ddash - ask before the network
///
/// Runs a loopback HTTP proxy that asks you, once per domain, whether a
/// sandboxed command may connect.
#[derive(Parser, Debug)]
#[command(name = "ddash")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Silent mode - suppress the decision summary
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the permission proxy until interrupted
    #[command(after_help = "EXAMPLES:
    # Run the proxy in the background, then export its address
    ddash proxy --name 'npm install' > /tmp/ddash.env &
    sleep 1; set -a; . /tmp/ddash.env; set +a

    # Fixed port, do not write decisions back
    ddash proxy --port 8899 --no-save
")]
    Proxy(ProxyArgs),

    /// List the domain decisions saved in the project config
    Domains(DomainsArgs),
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Project config holding pre-seeded domain decisions
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Address to listen on
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port to listen on (0 picks a free port)
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub port: u16,

    /// Command name shown in prompts
    #[arg(long, value_name = "CMD", default_value = "command")]
    pub name: String,

    /// Do not merge always/never decisions back into the config
    #[arg(long)]
    pub no_save: bool,
}

#[derive(Args, Debug)]
pub struct DomainsArgs {
    /// Project config to read
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}
