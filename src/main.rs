//! Sockrelay CLI entry point
//!
//! # Usage
//!
//! ```bash
//! sockrelay serve --socket /tmp/sockrelay.sock -n 10
//! sockrelay serve --address 127.0.0.1 --port 7070 --mode echo
//! sockrelay send -f notes.txt --port 7070
//! ```

use std::process::ExitCode;

use anyhow::Context;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use sockrelay::cli::{Commands, SendArgs, ServeArgs};
use sockrelay::config::FileConfig;
use sockrelay::{client, Cli, RelayError, Server};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<RelayError>()
                .map(RelayError::exit_code)
                .unwrap_or(ExitCode::FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve(args, cli.verbose).await,
        Commands::Send(args) => run_send(args, cli.verbose).await,
    }
}

async fn run_serve(args: ServeArgs, verbose: bool) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load_from(path)?,
        None => FileConfig::default(),
    };
    init_logging(verbose, &file.logging.level)?;

    let config = file.server.merge(args.overrides()).into_config()?;
    let server = Server::start(config).await?;

    let result = server.run_until_signal().await;
    if result.is_err() {
        server.shutdown().await;
    }
    result.context("Failed to install signal handlers")
}

async fn run_send(args: SendArgs, verbose: bool) -> anyhow::Result<()> {
    init_logging(verbose, "warn")?;

    let target = args.target.target()?;
    let response = client::send_file(&target, &args.file)
        .await
        .with_context(|| format!("Failed to send {} to {}", args.file.display(), target))?;

    println!("{}", response);
    Ok(())
}

/// Install the fmt subscriber on stderr. `RUST_LOG` adds directives on top
/// of the crate default.
fn init_logging(verbose: bool, level: &str) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { level };
    let directive: Directive = format!("sockrelay={}", level)
        .parse()
        .with_context(|| format!("Invalid log level '{}'", level))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
