use crate::cli_options::{CliCommand, CliOptions};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use hybrid_store_core::HybridOnlineStore;
use hybrid_store_core::config::RepoConfig;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

const REPO_DIR_ENV_VAR: &str = "HYBRID_STORE_REPO_DIR";
const YAML_FILE_PATH_ENV_VAR: &str = "HYBRID_STORE_YAML_FILE_PATH";
const DEFAULT_FEATURE_STORE_FILE_NAME: &str = "feature_store.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let CliOptions {
        chdir,
        log_level,
        feature_store_yaml,
        command,
    } = CliOptions::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cwd = if let Some(path) = chdir.or_else(|| std::env::var(REPO_DIR_ENV_VAR).ok()) {
        PathBuf::from(path)
    } else {
        std::env::current_dir()?
    };
    let cwd_str = cwd
        .to_str()
        .ok_or_else(|| anyhow!("Feature repository path contains invalid UTF-8"))?;

    let feature_store_yaml = feature_store_yaml
        .or(std::env::var(YAML_FILE_PATH_ENV_VAR).ok())
        .unwrap_or(DEFAULT_FEATURE_STORE_FILE_NAME.to_string());
    let config_path = cwd.join(&feature_store_yaml);
    let yaml_str = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let repo_config = RepoConfig::from_yaml_str(&yaml_str)?;
    let store = Arc::new(HybridOnlineStore::from_config(&repo_config, Some(cwd_str))?);

    match command {
        CliCommand::Serve {
            host,
            port,
            key,
            cert,
            metrics_enabled,
        } => {
            if key.is_some() && cert.is_none() || key.is_none() && cert.is_some() {
                return Err(anyhow!(
                    "Both --key and --cert must be provided to enable TLS"
                ));
            }
            tracing::info!("Start serving project {} on {}:{}", repo_config.project, host, port);
            let server_config = rest_server::server::ServerConfig {
                host,
                port,
                tls_enabled: key.is_some() && cert.is_some(),
                tls_cert_path: cert,
                tls_key_path: key,
            };
            let handler = axum_server::Handle::new();
            serve_until_signal(server_config, store.clone(), metrics_enabled, handler).await?;
            store.close().await?;
        }
        CliCommand::Check => check(&store).await?,
        CliCommand::Teardown => {
            store.teardown().await?;
            tracing::info!("Dropped every feature view of project {}", repo_config.project);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn serve_until_signal(
    server_config: rest_server::server::ServerConfig,
    store: Arc<HybridOnlineStore>,
    metrics_enabled: bool,
    handler: axum_server::Handle,
) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let serve =
        rest_server::server::start_server(server_config, store, metrics_enabled, handler.clone());
    tokio::select! {
        res = serve => {
            res?
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
            handler.graceful_shutdown(Some(Duration::from_secs(5)));
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            handler.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn serve_until_signal(
    server_config: rest_server::server::ServerConfig,
    store: Arc<HybridOnlineStore>,
    metrics_enabled: bool,
    handler: axum_server::Handle,
) -> Result<()> {
    let serve =
        rest_server::server::start_server(server_config, store, metrics_enabled, handler.clone());
    tokio::select! {
        res = serve => {
            res?
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            handler.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    }
    Ok(())
}

async fn check(store: &HybridOnlineStore) -> Result<()> {
    let mut backends: Vec<&str> = store.registry().names().collect();
    backends.sort();
    let mut failed = Vec::new();
    for backend in backends {
        if let Err(err) = store.registry().resolve(backend).await {
            tracing::error!("Backend {} is unreachable: {}", backend, err);
            failed.push(backend.to_string());
        }
    }
    for (backend, status) in store.health_check().await {
        match status {
            Ok(()) => tracing::info!("Backend {} is healthy", backend),
            Err(err) => {
                tracing::error!("Backend {} failed its health check: {}", backend, err);
                failed.push(backend);
            }
        }
    }

    let mut views: Vec<_> = store.feature_views().collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));
    for view in views {
        match store.routing().route(&view.name) {
            Ok(backend) => tracing::info!("Feature view {} -> {}", view.name, backend),
            Err(err) => tracing::warn!("{}", err),
        }
    }
    store.close().await?;

    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("Unhealthy backends: [{}]", failed.join(", ")))
    }
}
