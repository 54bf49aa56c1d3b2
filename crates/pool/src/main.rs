use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hyperv_sdk::{HyperVDriver, HypervisorDriver, MockDriver};
use runner_pool::config::{ConfigError, FileConfig};
use runner_pool::identity::{GithubClient, IdentityClient, IdentityError, MockIdentity};
use runner_pool::logging::{self, LoggingError};
use runner_pool::pool::{Pool, PoolError};

const COMMIT: &str = match option_env!("RUNNER_POOL_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
const BUILD_DATE: &str = match option_env!("RUNNER_POOL_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

#[derive(Parser)]
#[command(name = "runner-pool", about = "Warm pool of ephemeral Hyper-V CI runners")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run headless even when the tray front-end is installed.
    #[arg(long)]
    no_tray: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print version information.
    Version,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("--config <path> is required")]
    MissingConfigFlag,

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Logging(#[from] LoggingError),

    #[error("{0}")]
    Identity(#[from] IdentityError),

    #[error("reading private key: {0}")]
    PrivateKey(#[from] std::io::Error),

    #[error("{0}")]
    Pool(#[from] PoolError),
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!(
            "runner-pool {} (commit {COMMIT}, built {BUILD_DATE})",
            env!("CARGO_PKG_VERSION")
        );
        return Ok(());
    }

    let path = cli.config.ok_or(MainError::MissingConfigFlag)?;
    let config = FileConfig::load(&path)?;
    logging::init(&config.logging)?;

    if !cli.no_tray {
        tracing::debug!("tray front-end not bundled with this binary; running headless");
    }

    let (driver, identity) = build_collaborators(&config)?;
    let pool = Pool::new(config.pool_config(), driver, identity);
    pool.initialize().await;

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    pool.shutdown().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

type Collaborators = (Arc<dyn HypervisorDriver>, Arc<dyn IdentityClient>);

fn build_collaborators(config: &FileConfig) -> Result<Collaborators, MainError> {
    if config.debug.use_mock {
        tracing::info!("mock mode: no hypervisor or network calls will be made");
        let identity = Arc::new(MockIdentity::new());
        let driver = Arc::new(MockDriver::new());
        let registry = Arc::clone(&identity);
        // A booted mock VM registers itself, like the real guest agent does.
        driver.set_on_boot(move |name| registry.register_online(name));
        return Ok((
            driver as Arc<dyn HypervisorDriver>,
            identity as Arc<dyn IdentityClient>,
        ));
    }

    let app_id = config.github.app_id.ok_or(ConfigError::MissingAppId)?;
    let key_path = config
        .github
        .app_private_key_path
        .as_ref()
        .ok_or(ConfigError::MissingPrivateKey)?;
    let key = std::fs::read(key_path)?;
    let scope = config.runner_scope()?;
    let identity = Arc::new(GithubClient::new(app_id, &key, scope)?);
    let driver = Arc::new(HyperVDriver::new(config.driver_config()?));
    Ok((
        driver as Arc<dyn HypervisorDriver>,
        identity as Arc<dyn IdentityClient>,
    ))
}

/// Map the host's interrupt and terminate signals to shutdown.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            tracing::error!(%error, "failed to install terminate handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
