use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use overlord_core::{Overlord, OverlordConfig};

#[derive(Parser)]
#[command(
    name = "overlord",
    about = "issue-queue orchestrator for sandboxed minion workers",
    version
)]
struct Cli {
    /// Base directory for overlord state (default: ~/.overlord, or OVERLORD_DIR)
    #[arg(long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Run,

    /// Validate configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    let dir = resolve_dir(&cli);
    let config = match OverlordConfig::load(&dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => match config.validate() {
            Ok(()) => {
                println!("configuration OK");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(2)
            }
        },

        Commands::Run => {
            if let Err(e) = config.validate() {
                eprintln!("{e}");
                return ExitCode::from(2);
            }

            let overlord = match Overlord::from_config(config).await {
                Ok(overlord) => overlord,
                Err(e) => {
                    eprintln!("error: start-up failed: {e:#}");
                    return ExitCode::FAILURE;
                }
            };

            let signaled = overlord.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received");
                signaled.shutdown();
            });

            match overlord.run().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn resolve_dir(cli: &Cli) -> PathBuf {
    if let Some(dir) = &cli.dir {
        return dir.clone();
    }
    if let Some(dir) = std::env::var_os("OVERLORD_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".overlord"),
        None => PathBuf::from(".overlord"),
    }
}

/// Wire up tracing from `LOG_LEVEL`, `LOG_FORMAT`, and `LOG_FILE`.
///
/// Returns the file writer's flush guard; it must live as long as main.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    match std::env::var("LOG_FILE").ok().filter(|p| !p.is_empty()) {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("overlord.log"));
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, file),
            );
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
