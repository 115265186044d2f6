#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod breakglass;
mod crdump;
mod hcp;
mod mc;
mod output;
mod portforward;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[clap(
    name = "hcpctl",
    version,
    about = "Breakglass access to management clusters and hosted control planes"
)]
struct Cli {
    #[clap(long, default_value = "hcpctl=warn", env = "HCPCTL_LOG", global = true)]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Management cluster operations.
    #[clap(subcommand)]
    Mc(mc::Command),

    /// Hosted control plane operations.
    #[clap(subcommand)]
    Hcp(hcp::Command),
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { log_level, command } = Cli::parse();

    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid --log-level {log_level:?}"))?;
    // Diagnostics go to stderr so listings on stdout can be piped.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match command {
        Command::Mc(cmd) => cmd.run().await,
        Command::Hcp(cmd) => cmd.run().await,
    }
}
