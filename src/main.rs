mod collectors;
mod config;
mod control;
mod history;
mod http;
mod metrics;
mod state;

use axum::serve;
use clap::{Parser, Subcommand};
use collectors::gpu::GpuAdapter;
use collectors::services::ServiceAdapter;
use collectors::{now_unix, GpuCollector, ServiceCollector};
use config::{Config, ConfigRegistry};
use control::ControlDispatcher;
use history::HistoryStore;
use http::HttpAppState;
use metrics::Metrics;
use reqwest::Client;
use state::SnapshotStore;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpuwatchd")]
#[command(version)]
struct Cli {
    /// Config file; defaults to `server.yaml` in the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the collectors and the HTTP gateway (default).
    Serve,
    /// Read or change a config value.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Delete the GPU sample history.
    Clean {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_agent(&config_path).await,
        Command::Config { action } => config_command(&config_path, action),
        Command::Clean { yes } => clean_history(&config_path, yes),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> Config {
    match Config::load_or_default(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, path = %path.display(), "failed to load config");
            std::process::exit(1);
        }
    }
}

async fn run_agent(config_path: &Path) {
    let cfg = load_config(config_path);
    info!(
        listen = %cfg.listen,
        config = %config_path.display(),
        gpu_interval = ?cfg.gpu_interval,
        service_interval = ?cfg.service_interval,
        endpoints = cfg.endpoints.len(),
        "starting gpuwatchd"
    );
    if cfg.endpoints.is_empty() {
        warn!("no service endpoints configured, service status will report not_configured");
    }

    let history = match HistoryStore::open(&cfg.gpu_sample_db) {
        Ok(history) => Arc::new(history),
        Err(err) => {
            error!(error = %err, "failed to open history store");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };
    let store = Arc::new(SnapshotStore::new());
    let client = Client::builder()
        .user_agent("gpuwatchd/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app_state = HttpAppState {
            metrics: metrics.clone(),
            store: store.clone(),
            history: history.clone(),
            dispatcher: Arc::new(ControlDispatcher::from_config(&cfg)),
            client: client.clone(),
            default_endpoint: cfg.default_endpoint().map(|e| e.url.clone()),
            history_default_range_secs: cfg.history_default_range_secs,
            shutdown: shutdown_rx.clone(),
        };
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, listen = %addr, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(listen = %addr, "HTTP gateway listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let gpu_task = {
        let collector = GpuCollector::new(
            GpuAdapter::new(&cfg.nvidia_smi_path),
            store.clone(),
            history.clone(),
            metrics.clone(),
        );
        tokio::spawn(collector.run(cfg.gpu_interval, shutdown_rx.clone()))
    };

    let service_task = {
        let collector = ServiceCollector::new(
            ServiceAdapter::new(client, cfg.service_timeout),
            cfg.endpoints.clone(),
            store,
            metrics.clone(),
        );
        tokio::spawn(collector.run(cfg.service_interval, shutdown_rx))
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = gpu_task.await;
    let _ = service_task.await;
    let _ = http_task.await;

    info!(
        uptime_secs = now_unix().saturating_sub(metrics.started_at_unix()),
        history_records = history.len(),
        "collectors stopped"
    );
    close_history(history);
}

/// The last owner closes the store; if a handle is still alive somewhere the
/// store is only flushed.
fn close_history(history: Arc<HistoryStore>) {
    match Arc::try_unwrap(history) {
        Ok(history) => {
            if let Err(err) = history.close() {
                error!(error = %err, "failed to close history store");
            }
        }
        Err(shared) => {
            warn!("history store still shared at shutdown, flushing only");
            if let Err(err) = shared.flush() {
                error!(error = %err, "failed to flush history store");
            }
        }
    }
}

fn config_command(config_path: &Path, action: ConfigAction) {
    let registry = ConfigRegistry::new();
    let mut cfg = load_config(config_path);

    match action {
        ConfigAction::List => {
            for key in registry.keys() {
                match registry.get(&cfg, key) {
                    Ok(value) => println!("{key}: {value}"),
                    Err(err) => warn!(key, error = %err, "failed to read config key"),
                }
            }
        }
        ConfigAction::Get { key } => match registry.get(&cfg, &key) {
            Ok(value) => println!("{value}"),
            Err(err) => {
                error!(key = %key, error = %err, "config get failed");
                std::process::exit(1);
            }
        },
        ConfigAction::Set { key, value } => {
            let result = registry
                .set(&mut cfg, &key, &value)
                .and_then(|()| cfg.validate())
                .and_then(|()| cfg.save_to_file(config_path));
            if let Err(err) = result {
                error!(key = %key, error = %err, "config set failed");
                std::process::exit(1);
            }
            info!(key = %key, path = %config_path.display(), "config updated");
        }
    }
}

fn clean_history(config_path: &Path, assume_yes: bool) {
    let cfg = load_config(config_path);
    let db_path = PathBuf::from(&cfg.gpu_sample_db);
    if !db_path.exists() {
        info!(path = %db_path.display(), "no history to clean");
        return;
    }

    if !assume_yes {
        let prompt = format!("Delete GPU history at {}? [y/N] ", db_path.display());
        if !confirm(&prompt) {
            info!("clean aborted");
            return;
        }
    }

    match std::fs::remove_dir_all(&db_path) {
        Ok(()) => info!(path = %db_path.display(), "history deleted"),
        Err(err) => {
            error!(path = %db_path.display(), error = %err, "failed to delete history");
            std::process::exit(1);
        }
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    is_affirmative(&answer)
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
