//! HotPocket node binary.

use clap::{Parser, Subcommand};
use hotpocket_node::ContractCtx;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotpocket", about = "BFT replication substrate for deterministic contracts", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new contract directory with a default config.
    New {
        /// Contract directory to create.
        dir: String,
    },
    /// Regenerate the node's signing keys in place.
    Rekey {
        /// Existing contract directory.
        dir: String,
    },
    /// Run the node.
    Run {
        /// Existing contract directory.
        dir: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Command::New { dir } => ContractCtx::new(&dir).create_new().map_err(Into::into),
        Command::Rekey { dir } => ContractCtx::new(&dir).rekey().map_err(Into::into),
        Command::Run { dir } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("tokio runtime");
            runtime.block_on(hotpocket_node::run(ContractCtx::new(&dir)))
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
