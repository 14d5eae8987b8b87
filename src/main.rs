use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::task::TaskTracker;

use kvproxy::{config::Config, routes::build_router, state::AppState};

#[derive(Parser, Debug)]
#[command(version, about = "KV-cache-aware reverse proxy for chat completions", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default).
    Serve,
    /// Load and validate configuration, print a summary, and exit without binding a socket.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate environment-derived configuration.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = match Config::from_env() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("invalid configuration: {e}");
                    return ExitCode::FAILURE;
                }
            };
            kvproxy::observability::init_tracing(&config.log_level);
            run_server(config).await
        }
        Command::Config {
            action: ConfigAction::Check,
        } => match Config::from_env() {
            Ok(config) => {
                println!("configuration OK");
                println!("  backends:   {}", config.backends.len());
                println!("  total slots: {}", config.total_slots());
                println!("  meta dir:   {}", config.meta_dir.display());
                println!("  port:       {}", config.port);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("invalid configuration: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_server(config: Config) -> ExitCode {
    let port = config.port;
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize application state");
            return ExitCode::FAILURE;
        }
    };

    let task_tracker = state.task_tracker.clone();
    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(address = %bind_addr, "kvproxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(task_tracker))
        .await
        .expect("server error");

    ExitCode::SUCCESS
}

async fn shutdown_signal(task_tracker: TaskTracker) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    task_tracker.close();
    task_tracker.wait().await;
}
