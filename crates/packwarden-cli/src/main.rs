//! Packwarden - runs module packages on a Kubernetes cluster

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;
mod commands;
mod error;
mod exit_codes;
mod logging;

use commands::dump;
use commands::start::StartArgs;
use error::Result;
use logging::LogFormat;

#[derive(Parser)]
#[command(name = "packwarden")]
#[command(author = "Packwarden Contributors")]
#[command(version)]
#[command(about = "Kubernetes package lifecycle operator", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter, e.g. `info` or `packwarden_runtime=debug` [default: RUST_LOG or info]
    #[arg(long, global = true, env = "PACKWARDEN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, env = "PACKWARDEN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Debug server socket
    #[arg(long, global = true, env = "PACKWARDEN_DEBUG_SOCKET", default_value = packwarden_runtime::debug::DEFAULT_SOCKET)]
    debug_socket: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator
    Start(StartArgs),

    /// Inspect package queues
    Queue {
        #[command(subcommand)]
        command: DumpCommand,
    },

    /// Inspect loaded packages
    Packages {
        #[command(subcommand)]
        command: DumpCommand,
    },

    /// Inspect the scheduler graph
    Scheduler {
        #[command(subcommand)]
        command: DumpCommand,
    },

    /// Render the manifests of a loaded package
    Render {
        /// Package name
        name: String,
    },
}

#[derive(Subcommand)]
enum DumpCommand {
    /// Print the state as YAML
    Dump,
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let code = e.exit_code();
        eprintln!("{:?}", miette::Report::new(e));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start(args) => {
            logging::init(cli.log_level.as_deref(), cli.log_format)?;
            commands::start::run(args, cli.debug_socket).await
        }
        Commands::Queue {
            command: DumpCommand::Dump,
        } => dump::run(&cli.debug_socket, dump::QUEUES),
        Commands::Packages {
            command: DumpCommand::Dump,
        } => dump::run(&cli.debug_socket, dump::PACKAGES),
        Commands::Scheduler {
            command: DumpCommand::Dump,
        } => dump::run(&cli.debug_socket, dump::SCHEDULER),
        Commands::Render { name } => dump::run(&cli.debug_socket, &dump::render_path(&name)),
    }
}
