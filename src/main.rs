use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use custodian::artifacts::LocalArtifactStore;
use custodian::bus::EventBus;
use custodian::config::Config;
use custodian::differ::cache::DiffCache;
use custodian::differ::{self, DifferState};
use custodian::publisher::vcs::HttpVcsPublisher;
use custodian::publisher::{self, PublisherState};
use custodian::runner::hosts::HostLimiter;
use custodian::runner::{self, RunnerState, queue};
use custodian::state::models::Worker;
use custodian::state::{Db, StateDb};

#[derive(Parser)]
#[command(name = "custodian")]
#[command(version, about = "Control plane for automated code-change campaigns")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or all of the control-plane components
    Serve {
        #[arg(long, value_enum, default_value_t = Component::All)]
        component: Component,
        /// Permissive CORS for local UI development.
        #[arg(long)]
        dev: bool,
    },
    /// Insert a queue item directly into the state store
    Schedule {
        codebase: String,
        campaign: String,
        /// Priority offset; negative schedules earlier.
        #[arg(long, allow_hyphen_values = true)]
        offset: Option<i64>,
        /// Discard the resume baseline for this build.
        #[arg(long)]
        refresh: bool,
    },
    /// Enroll a worker (or rotate its credentials)
    AddWorker {
        name: String,
        password: String,
        #[arg(long)]
        link: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Component {
    All,
    Runner,
    Publisher,
    Differ,
}

impl Component {
    fn includes(&self, other: Component) -> bool {
        *self == Component::All || *self == other
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { component, dev } => serve(config, component, dev).await,
        Commands::Schedule {
            codebase,
            campaign,
            offset,
            refresh,
        } => {
            let db = open_db(&config)?;
            let response = db
                .call(move |db| {
                    queue::schedule(
                        db,
                        &queue::ScheduleRequest {
                            codebase,
                            campaign,
                            command: None,
                            change_set: None,
                            offset,
                            bucket: None,
                            requester: Some("cli".into()),
                            refresh,
                        },
                    )
                    .map_err(|e| anyhow::anyhow!(e))
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::AddWorker {
            name,
            password,
            link,
        } => {
            let db = open_db(&config)?;
            let display = name.clone();
            db.call(move |db| {
                db.upsert_worker(&Worker {
                    name,
                    password,
                    link,
                })
            })
            .await?;
            println!("Enrolled worker {display}");
            Ok(())
        }
    }
}

fn open_db(config: &Config) -> Result<Db> {
    let state = if config.database_path == PathBuf::from(":memory:") {
        StateDb::new_in_memory()?
    } else {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }
        StateDb::new(&config.database_path)?
    };
    Ok(Db::new(state))
}

async fn serve(config: Config, component: Component, dev: bool) -> Result<()> {
    config.ensure_directories()?;
    let db = open_db(&config)?;
    let bus = EventBus::new(db.clone());
    let artifacts = Arc::new(LocalArtifactStore::new(
        config.artifact_dir(),
        config.log_dir(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut servers = Vec::new();

    if component.includes(Component::Runner) {
        let state = Arc::new(RunnerState {
            db: db.clone(),
            bus: bus.clone(),
            artifacts: artifacts.clone(),
            hosts: Arc::new(HostLimiter::new(&config.runner)),
            config: config.runner.clone(),
            http: reqwest::Client::new(),
            staging_dir: config.staging_dir(),
        });
        runner::watchdog::spawn(Arc::clone(&state));
        servers.push(spawn_server(
            "runner",
            &config.runner.listen,
            runner::api::router(state),
            dev,
            shutdown_rx.clone(),
        )
        .await?);
    }

    if component.includes(Component::Publisher) {
        let state = Arc::new(PublisherState::new(
            db.clone(),
            bus.clone(),
            Arc::new(HttpVcsPublisher::new(config.publisher.vcs_url.clone())),
            config.publisher.clone(),
        ));
        publisher::sweep::spawn_queue_loop(Arc::clone(&state));
        publisher::proposals::spawn_scan_loop(Arc::clone(&state));
        servers.push(spawn_server(
            "publisher",
            &config.publisher.listen,
            publisher::api::router(state),
            dev,
            shutdown_rx.clone(),
        )
        .await?);
    }

    if component.includes(Component::Differ) {
        let state = Arc::new(DifferState::new(
            db.clone(),
            bus.clone(),
            artifacts.clone(),
            DiffCache::new(config.diff_cache_dir()),
            config.differ.clone(),
        ));
        differ::precache::spawn_subscriber(Arc::clone(&state));
        servers.push(spawn_server(
            "differ",
            &config.differ.listen,
            differ::api::router(state),
            dev,
            shutdown_rx.clone(),
        )
        .await?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    for server in servers {
        let _ = server.await;
    }
    tracing::info!("shut down gracefully");
    Ok(())
}

async fn spawn_server(
    name: &'static str,
    listen: &str,
    mut app: axum::Router,
    dev: bool,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    if dev {
        app = app.layer(tower_http::cors::CorsLayer::permissive());
    }
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {name} to {listen}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(component = name, addr = %local_addr, "listening");
    Ok(tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(component = name, error = %err, "server error");
        }
    }))
}
