//! rstats-mcp: MCP server exposing R statistical analyses to AI assistants
//!
//! Each tool call runs an R script in a fresh `Rscript` process and returns
//! the result as a table, a short interpretation and structured JSON.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use rstats_mcp::config;
use rstats_mcp::lifespan::Lifespan;
use rstats_mcp::mcp::{serve_http, McpServer, StdioTransport};
use rstats_mcp::stats;

/// Transport to serve MCP over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// Streamable HTTP on `http.bind`.
    Http,
}

/// MCP server exposing R statistical analyses as tools.
///
/// Runs correlation, descriptive statistics, linear regression and t-tests
/// in R on inline data or CSV files under the configured directories.
#[derive(Parser, Debug)]
#[command(name = "rstats-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,

    /// Transport to serve on
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,

    /// Address for the HTTP transport (overrides `http.bind`)
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Never write to disk (overrides `read_only`)
    #[arg(long)]
    read_only: bool,

    /// Print tools, resources and prompts as JSON and exit
    #[arg(long)]
    dump_capabilities: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr; stdout carries
/// protocol frames.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Completes on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Cannot install signal handlers; falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Completes on Ctrl+C.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

/// Entry point for the rstats-mcp server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nConfig read from: {}", default_path.display());
                    eprintln!("See config/example-config.json for the format");
                }
            }
            return ExitCode::FAILURE;
        }
    };
    if args.read_only {
        cfg.read_only = true;
    }
    if let Some(bind) = args.bind {
        cfg.http.bind = bind;
    }

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    let registries = match stats::default_registries() {
        Ok(registries) => registries,
        Err(e) => {
            error!(error = %e, "Failed to register tools");
            return ExitCode::FAILURE;
        }
    };

    let lifespan = match Lifespan::create(&cfg, &stats::script_sources()) {
        Ok(lifespan) => lifespan,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return ExitCode::FAILURE;
        }
    };

    let server = McpServer::new(
        registries,
        lifespan,
        cfg.server.drain_grace(),
    );

    if args.dump_capabilities {
        return match serde_json::to_string_pretty(&server.capabilities_dump()) {
            Ok(json) => {
                println!("{json}");
                server.shutdown();
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Failed to serialise capabilities");
                ExitCode::FAILURE
            }
        };
    }

    // Display GPL license notice (required by GPLv3 Section 5d)
    eprintln!(
        "rstats-mcp {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!("Source: {}", env!("CARGO_PKG_REPOSITORY"));
    eprintln!();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?args.transport,
        allowed_paths = ?cfg.allowed_paths,
        "Starting rstats-mcp server"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match args.transport {
            TransportKind::Stdio => {
                server
                    .serve_with_shutdown(StdioTransport::new(), shutdown_signal())
                    .await
            }
            TransportKind::Http => {
                serve_http(
                    server.clone(),
                    cfg.http.bind,
                    &cfg.http.path,
                    shutdown_signal(),
                )
                .await
            }
        }
    });

    server.shutdown();

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn transport_and_overrides_parse() {
        let args = Args::parse_from([
            "rstats-mcp",
            "--transport",
            "http",
            "--bind",
            "127.0.0.1:9000",
            "--read-only",
        ]);
        assert_eq!(args.transport, TransportKind::Http);
        assert_eq!(args.bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert!(args.read_only);
        assert!(!args.dump_capabilities);
    }

    #[test]
    fn log_level_precedence() {
        assert_eq!(get_log_level(0, true, "trace"), Level::ERROR);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "info"), Level::INFO);
        assert_eq!(get_log_level(0, false, "loud"), Level::WARN);
    }
}
