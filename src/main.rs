//! qsys-broker - MCP control-and-telemetry broker for Q-SYS cores.
//!
//! This is the binary entry point. See the `qsys_broker` library for the
//! broker runtime itself.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use qsys_broker::{Broker, Config};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "qsys-broker", about = "MCP broker for Q-SYS cores", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP on stdio (the default).
    Serve,
    /// Validate the configuration and event-store path, then exit.
    CheckConfig,
    /// Print the version and exit.
    Version,
}

fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Version => {
            println!("qsys-broker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::CheckConfig => check_config(cli.config.as_deref()),
        Command::Serve => serve(cli.config.as_deref()),
    }
}

/// Initialize env_logger on stderr.
///
/// stdout belongs to the MCP transport — nothing else may write there.
/// `LOG_LEVEL` is the operational override; `RUST_LOG` still wins for
/// fine-grained module filters.
fn init_logger() {
    let default = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

/// Validate config and the event-store directory, loudly.
fn check_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(path)?;
    println!("configuration ok");
    println!("  core: {}", config.connection.url());
    println!(
        "  recorder: enabled={} path={} retention={}d",
        config.recorder.enabled,
        config.recorder.path.display(),
        config.recorder.retention_days
    );
    if config.recorder.enabled {
        // Same probe the recorder runs at startup; surfacing it here
        // lets deployment scripts fail before the broker ever starts.
        qsys_broker::events::EventStore::open(&config.recorder.path)
            .map_err(|e| anyhow::anyhow!("event store check failed: {e}"))?;
        println!("  event store writable");
    }
    Ok(())
}

/// Run the broker until stdin closes or an interrupt arrives.
fn serve(path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(path)?;
    log::info!(
        "qsys-broker {} starting (core {})",
        env!("CARGO_PKG_VERSION"),
        config.connection.url()
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { Broker::new(config).run().await })
}
