//! rollguardd — the rollguard daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Health monitor with the instance probe
//! - Rollback executor (webhook, or a failing stub when unconfigured)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rollguardd serve --config /etc/rollguard/rollguard.toml --port 8443
//! rollguardd check-config --config /etc/rollguard/rollguard.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rollguard_core::RollguardConfig;
use rollguard_health::{HealthMonitor, InstanceProbe, TracingNotifier};
use rollguard_rollout::{MonitorOptions, RollbackExecutor, UnconfiguredRollback, WebhookRollback};
use rollguard_state::StateStore;

#[derive(Parser)]
#[command(name = "rollguardd", about = "rollguard post-deploy health monitor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and health monitor.
    Serve {
        /// Path to rollguard.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Validate a config file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_filter = "info,rollguardd=debug,rollguard=debug";
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.set_port(port);
            }
            if let Some(dir) = data_dir {
                config.set_data_dir(dir);
            }
            run(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RollguardConfig> {
    let config = match path {
        Some(path) => RollguardConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RollguardConfig::default(),
    };
    for problem in config.validate() {
        warn!(%problem, "config value ignored, using default");
    }
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = RollguardConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let problems = config.validate();
    for problem in &problems {
        eprintln!("error: {problem}");
    }
    if !problems.is_empty() {
        anyhow::bail!("{} problem(s) in {}", problems.len(), path.display());
    }

    println!("port              = {}", config.port());
    println!("data_dir          = {}", config.data_dir().display());
    println!("failure_threshold = {}", config.failure_threshold());
    println!("probe_timeout     = {:?}", config.probe_timeout());
    println!("rollback_timeout  = {:?}", config.rollback_timeout());
    println!("probe_path        = {}", config.probe_path());
    println!("webhook_url       = {}", config.webhook_url().unwrap_or("(none)"));
    Ok(())
}

fn monitor_options(config: &RollguardConfig) -> MonitorOptions {
    MonitorOptions {
        failure_threshold: config.failure_threshold(),
        probe_timeout: config.probe_timeout(),
        rollback_timeout: config.rollback_timeout(),
    }
}

fn rollback_executor(config: &RollguardConfig) -> anyhow::Result<Arc<dyn RollbackExecutor>> {
    match config.webhook_url() {
        Some(url) => {
            let webhook = WebhookRollback::new(url, config.rollback_timeout())
                .context("configuring rollback webhook")?;
            info!(%url, "rollback webhook configured");
            Ok(Arc::new(webhook))
        }
        None => {
            warn!("no rollback webhook configured, rollbacks will fail and be reported as critical");
            Ok(Arc::new(UnconfiguredRollback))
        }
    }
}

async fn run(config: RollguardConfig) -> anyhow::Result<()> {
    info!("rollguard daemon starting");

    // Ensure data directory exists.
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("rollguard.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let probe = InstanceProbe::new(state.clone(), config.probe_path(), config.probe_timeout());
    let options = monitor_options(&config);
    let monitor = HealthMonitor::new(state.clone(), Arc::new(probe), rollback_executor(&config)?)
        .with_notifier(Arc::new(TracingNotifier))
        .with_options(options);
    info!(
        failure_threshold = options.effective_failure_threshold(),
        probe_timeout = ?options.probe_timeout,
        rollback_timeout = ?options.rollback_timeout,
        "health monitor initialized"
    );

    // ── Start API server ───────────────────────────────────────

    let router = rollguard_api::build_router(state, monitor.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // Running sessions end as aborted (cancelled) and are archived.
    monitor.stop_all().await;

    info!("rollguard daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn options_follow_config() {
        let config = RollguardConfig::parse(
            "[monitor]\nfailure_threshold = 4\nprobe_timeout = \"2s\"\nrollback_timeout = \"30s\"\n",
        )
        .unwrap();
        let options = monitor_options(&config);
        assert_eq!(options.failure_threshold, 4);
        assert_eq!(options.probe_timeout, Duration::from_secs(2));
        assert_eq!(options.rollback_timeout, Duration::from_secs(30));
    }

    #[test]
    fn default_options_match_monitor_defaults() {
        let options = monitor_options(&RollguardConfig::default());
        let defaults = MonitorOptions::default();
        assert_eq!(options.failure_threshold, defaults.failure_threshold);
        assert_eq!(options.probe_timeout, defaults.probe_timeout);
        assert_eq!(options.rollback_timeout, defaults.rollback_timeout);
    }

    #[test]
    fn bad_webhook_url_is_an_error() {
        let config = RollguardConfig::parse("[rollback]\nwebhook_url = \"ftp://nope\"\n").unwrap();
        assert!(rollback_executor(&config).is_err());
    }

    #[tokio::test]
    async fn missing_webhook_uses_failing_executor() {
        let executor = rollback_executor(&RollguardConfig::default()).unwrap();
        assert!(executor.rollback("web", "d1").await.is_err());
    }

    #[test]
    fn cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from(["rollguardd", "serve", "--port", "9000", "--data-dir", "/tmp/rg"]).unwrap();
        match cli.command {
            Command::Serve { port, data_dir, config } => {
                assert_eq!(port, Some(9000));
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/rg")));
                assert!(config.is_none());
            }
            Command::CheckConfig { .. } => panic!("expected serve"),
        }
    }
}
