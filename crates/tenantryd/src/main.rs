//! tenantryd — the Tenantry daemon.
//!
//! Assembles the bookkeeping store, the platform database connection, the
//! secret cipher and the docker/script runner into a `TenantService`, then
//! serves the REST API.
//!
//! # Usage
//!
//! ```text
//! tenantryd serve --config /etc/tenantry/tenantry.toml --port 8000
//! tenantryd gen-key
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tenantry_core::TenantryConfig;
use tenantry_core::config::StorageBackend;
use tenantry_orchestrator::{ServiceDeps, TenantService, run_reporter};
use tenantry_runtime::TokioProcessRunner;
use tenantry_secrets::SecretCipher;
use tenantry_state::{Bookkeeping, PgPlatform, PgStore, StateStore, connect_pool};
use tracing::info;

#[derive(Parser)]
#[command(name = "tenantryd", about = "Tenantry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API.
    Serve {
        /// TOML configuration file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on, overriding config and environment.
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Print a fresh encryption key for `TENANTRY_SECRET_KEY`.
    GenKey,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tenantryd=debug,tenantry=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenKey => {
            println!("{}", SecretCipher::generate_key());
            Ok(())
        }
        Command::Serve {
            config,
            port,
            log_format,
        } => {
            init_tracing(log_format);
            run_serve(config.as_deref(), port).await
        }
    }
}

async fn open_store(config: &TenantryConfig) -> anyhow::Result<Arc<dyn Bookkeeping>> {
    match config.storage.backend {
        StorageBackend::Postgres => {
            let dsn = config
                .database
                .dsn
                .as_deref()
                .context("postgres storage requires database.dsn")?;
            let store = PgStore::connect(dsn, &config.database).await?;
            info!("postgres bookkeeping store ready");
            Ok(Arc::new(store))
        }
        StorageBackend::Embedded => {
            let dir = &config.storage.data_dir;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data dir {}", dir.display()))?;
            let path = dir.join("tenantry.redb");
            let store = StateStore::open(&path)?;
            info!(path = ?path, "embedded bookkeeping store opened");
            Ok(Arc::new(store))
        }
    }
}

async fn run_serve(config_path: Option<&Path>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = TenantryConfig::load(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    info!(backend = ?config.storage.backend, "Tenantry daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let cipher = SecretCipher::from_config(config.secrets.encryption_key.as_deref())
        .context("secret cipher")?;

    let store = open_store(&config).await?;

    let admin_dsn = config
        .database
        .admin_dsn()
        .context("platform access requires database.admin_dsn or database.dsn")?;
    let platform = PgPlatform::new(connect_pool(admin_dsn, &config.database).await?);
    info!("platform database connected");

    let (service, reports) = TenantService::new(
        ServiceDeps {
            store,
            platform: Arc::new(platform),
            runner: Arc::new(TokioProcessRunner),
            cipher: Arc::new(cipher),
        },
        &config,
    );
    let reporter = tokio::spawn(run_reporter(reports));

    // ── Start API server ───────────────────────────────────────

    let router = tenantry_api::build_router(Arc::new(service));
    let ip = config
        .server
        .bind
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let addr = SocketAddr::new(ip, config.server.port);

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    reporter.abort();
    let _ = reporter.await;

    info!("Tenantry daemon stopped");
    Ok(())
}
