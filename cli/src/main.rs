use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};
use config::{load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "ferry=debug,ferry_cli=debug"
    } else {
        "ferry=warn,ferry_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async_main(cli));
    to_exit_code(result)
}

async fn async_main(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Host(args) => {
            let config = merge_config(file_config, &args.common)?;
            commands::host::execute(args, config).await
        }
        Commands::Invoke(args) => commands::invoke::execute(args).await,
        Commands::Worker(args) => {
            let config = merge_config(file_config, &args.common)?;
            commands::worker::execute(args, config).await
        }
    }
}
