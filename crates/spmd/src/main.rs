//! spmd - storage pool manager host daemon
//!
//! Binary name: `spmd`

use std::{path::PathBuf, process};

use clap::{Args, Parser, Subcommand};
use spm_core::DomainId;

mod commands;

#[derive(Parser)]
#[command(name = "spmd")]
#[command(about = "Storage pool manager: SPM cluster lock and volume-chain merges")]
struct Cli {
    /// Config file layered over the global one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Contend for the SPM role and hold it until interrupted
    Run {
        #[command(flatten)]
        domain: DomainArgs,
        /// Format the lock areas before contending
        #[arg(long)]
        init: bool,
    },
    /// Become SPM, run one merge job and print its report as JSON
    Merge {
        #[command(flatten)]
        domain: DomainArgs,
        /// JSON file holding the merge request (domain, image, base, top,
        /// base_generation, host_id)
        #[arg(long)]
        request: PathBuf,
    },
}

#[derive(Args)]
struct DomainArgs {
    /// Storage domain id
    #[arg(long)]
    domain: DomainId,
    /// This host's id in the domain lockspace (1-2000)
    #[arg(long)]
    host_id: u16,
    /// Host-id lease area
    #[arg(long)]
    ids: PathBuf,
    /// Leases volume holding the SPM lease
    #[arg(long)]
    leases: PathBuf,
    /// Directory holding the domain's images
    #[arg(long)]
    root: PathBuf,
    /// Domain format version
    #[arg(long, default_value_t = 5)]
    version: u32,
    /// Volumes are block devices and must be extended before a merge
    #[arg(long)]
    block: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = commands::dispatch(cli).await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {err:#}");
        }

        let code = err
            .downcast_ref::<spm_core::Error>()
            .map(spm_core::Error::exit_code)
            .unwrap_or_else(|| 1);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
