mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codelab-cli")]
#[command(about = "Codelab CLI - Validate, run and test snippets in the sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Host facilities to grant the snippet
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct CapabilityFlags {
    /// Allow `fetch` (answered from fixtures only)
    #[arg(long, default_value = "false")]
    pub allow_network: bool,

    /// Allow the in-memory `fs` object
    #[arg(long, default_value = "false")]
    pub allow_fs: bool,

    /// Allow `eval` and the Function constructor
    #[arg(long, default_value = "false")]
    pub allow_eval: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically analyze a snippet without running it
    Validate {
        /// Snippet source file
        file: PathBuf,

        #[command(flatten)]
        capabilities: CapabilityFlags,
    },

    /// Run a snippet once and print its console and result
    Run {
        /// Snippet source file
        file: PathBuf,

        /// Function to call (defaults to the completion value)
        #[arg(short, long)]
        entry: Option<String>,

        /// Arguments as a JSON array
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Timeout in milliseconds (clamped to the configured maximum)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        #[command(flatten)]
        capabilities: CapabilityFlags,
    },

    /// Run a test suite against a snippet; Ctrl-C stops between tests
    Test {
        /// Snippet source file
        file: PathBuf,

        /// Suite definition (JSON)
        suite: PathBuf,
    },

    /// Classify an error message
    Classify {
        /// Error message as shown to the learner
        message: String,

        /// Error constructor name (e.g. TypeError)
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    codelab_sandbox::worker::run_if_requested();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, capabilities } => {
            commands::validate(&file, capabilities)?;
        }
        Commands::Run {
            file,
            entry,
            args,
            timeout_ms,
            capabilities,
        } => {
            commands::run(&file, entry, &args, timeout_ms, capabilities).await?;
        }
        Commands::Test { file, suite } => {
            commands::test(&file, &suite).await?;
        }
        Commands::Classify { message, name } => {
            commands::classify(&message, name)?;
        }
    }

    Ok(())
}
