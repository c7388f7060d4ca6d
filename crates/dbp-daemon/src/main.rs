// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dbp_config::ServerConfig;
use dbp_daemon::{AppState, build_app};
use dbp_pool::{WorktreePool, WorktreePoolSettings};
use dbp_store::MetadataStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dbp-daemon", version, about = "debug-plane execution service")]
struct Cli {
    /// Path to the server TOML configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the HTTP/WebSocket daemon.
    Serve {
        /// Bind address override.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Mint an auth token and print its secret to stdout.
    CreateToken {
        /// Human-friendly token name.
        name: String,
        /// Comma-separated scope list.
        #[arg(long, default_value = "admin")]
        scopes: String,
        /// Optional expiry in days.
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Inspect and reclaim worktree pools.
    Pool {
        #[command(subcommand)]
        command: PoolCmd,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCmd {
    /// Print a summary of every worktree tracked for a repository.
    Show {
        /// Repository name.
        #[arg(long)]
        repository: String,
    },
    /// Delete idle worktrees older than the threshold.
    Reclaim {
        /// Repository name.
        #[arg(long)]
        repository: String,
        /// Idle age threshold, e.g. `30m`, `2h`, `1d`.
        #[arg(long, default_value = "1h")]
        older_than: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig::load(cli.config.as_deref()).context("load configuration")?;

    let filter = if cli.debug {
        EnvFilter::new("dbp=debug,info")
    } else {
        EnvFilter::new(config.log_level.clone().unwrap_or_else(|| "info".to_string()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Cmd::Serve { bind } => serve(config, bind).await,
        Cmd::CreateToken {
            name,
            scopes,
            expires_in_days,
        } => create_token(config, name, scopes, expires_in_days).await,
        Cmd::Pool { command } => match command {
            PoolCmd::Show { repository } => pool_show(config, repository).await,
            PoolCmd::Reclaim {
                repository,
                older_than,
            } => pool_reclaim(config, repository, older_than).await,
        },
    }
}

async fn serve(config: ServerConfig, bind: Option<String>) -> Result<()> {
    for dir in [
        &config.paths.artifacts_root,
        &config.paths.logs_dir,
        &config.paths.environments_dir,
        &config.paths.patches_dir,
        &config.paths.repos_dir,
        &config.paths.worktrees_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }

    let database_url = config.database_url();
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let store = MetadataStore::connect(&database_url)
        .await
        .with_context(|| format!("open metadata store at {database_url}"))?;

    let bind = bind.unwrap_or_else(|| config.bind.clone());
    let state = Arc::new(AppState::new(store, config));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "dbp-daemon listening");

    axum::serve(listener, app).await.context("serve")
}

async fn create_token(
    config: ServerConfig,
    name: String,
    scopes: String,
    expires_in_days: Option<i64>,
) -> Result<()> {
    let store = open_store(&config).await?;
    let scopes: Vec<String> = scopes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let expires_at = expires_in_days
        .filter(|days| *days > 0)
        .map(|days| Utc::now() + Duration::days(days));
    let (record, secret) = store.create_token(&name, &scopes, expires_at).await?;
    println!("Created token {} (id={})", record.name, record.id);
    println!("Bearer token: {secret}");
    Ok(())
}

async fn pool_show(config: ServerConfig, repository: String) -> Result<()> {
    let pool = open_pool(&config, &repository).await?;
    for row in pool.describe().await? {
        println!(
            "{}: {} | {} | commit={} | env={}",
            row.id,
            row.path,
            row.status.as_str(),
            row.commit.as_deref().unwrap_or("-"),
            row.environment_hash.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn pool_reclaim(config: ServerConfig, repository: String, older_than: String) -> Result<()> {
    let max_idle_age = parse_duration(&older_than)?;
    let pool = open_pool(&config, &repository).await?;
    let reclaimed = pool.reclaim_stale_worktrees(max_idle_age).await?;
    println!("Reclaimed {} worktrees", reclaimed.len());
    for path in reclaimed {
        println!(" - {}", path.display());
    }
    Ok(())
}

async fn open_store(config: &ServerConfig) -> Result<MetadataStore> {
    let database_url = config.database_url();
    MetadataStore::connect(&database_url)
        .await
        .with_context(|| format!("open metadata store at {database_url}"))
}

async fn open_pool(config: &ServerConfig, repository: &str) -> Result<WorktreePool> {
    let store = open_store(config).await?;
    let repo = store
        .get_repository_by_name(repository)
        .await?
        .with_context(|| format!("repository '{repository}' not found"))?;
    let settings = WorktreePoolSettings::new(
        repo.id,
        repo.remote_url.clone(),
        config.paths.repos_dir.join(format!("{}.bare", repo.name)),
        config.paths.worktrees_dir.join(&repo.name),
    );
    Ok(WorktreePool::new(store, settings)?)
}

fn parse_duration(value: &str) -> Result<Duration> {
    let (amount, unit) = value.split_at(value.len().saturating_sub(1));
    let amount: i64 = amount
        .parse()
        .with_context(|| format!("invalid duration '{value}'; use values such as 30m, 2h, or 1d"))?;
    let seconds = match unit {
        "s" | "S" => amount,
        "m" | "M" => amount * 60,
        "h" | "H" => amount * 3600,
        "d" | "D" => amount * 86_400,
        _ => bail!("invalid duration '{value}'; use values such as 30m, 2h, or 1d"),
    };
    Ok(Duration::seconds(seconds))
}
