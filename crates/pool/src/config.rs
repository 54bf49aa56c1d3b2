//! YAML configuration: parsing, defaults and startup validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyperv_sdk::HyperVDriverConfig;

use crate::identity::{IdentityError, RunnerScope};
use crate::pool::PoolConfig;

/// Virtual switch the runner VMs attach to.
const SWITCH_NAME: &str = "Default Switch";

/// How long shutdown waits for monitors to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("github.app_id is required")]
    MissingAppId,

    #[error("github.app_private_key_path is required")]
    MissingPrivateKey,

    #[error("github.app_private_key_path {0} does not exist")]
    PrivateKeyNotFound(PathBuf),

    #[error("one of github.org or github.user is required")]
    MissingAccount,

    #[error("github.org and github.user are mutually exclusive")]
    AmbiguousAccount,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("runners.cache_url must end with '/'")]
    CacheUrlMissingSlash,

    #[error("hyperv.template_path is required")]
    MissingTemplatePath,

    #[error("hyperv.storage_path is required")]
    MissingStoragePath,

    #[error("hyperv.vm_username and hyperv.vm_password are required")]
    MissingGuestCredentials,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub runners: RunnersConfig,
    #[serde(default)]
    pub hyperv: HypervConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub app_id: Option<u64>,
    pub app_private_key_path: Option<PathBuf>,
    pub org: Option<String>,
    pub user: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RunnersConfig {
    pub pool_size: usize,
    pub name_prefix: String,
    pub labels: Vec<String>,
    pub runner_group: Option<String>,
    pub cache_url: Option<String>,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            name_prefix: "runner-".into(),
            labels: Vec::new(),
            runner_group: None,
            cache_url: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HypervConfig {
    pub template_path: Option<PathBuf>,
    pub storage_path: Option<PathBuf>,
    pub vm_username: Option<String>,
    pub vm_password: Option<String>,
    pub vm_memory_mb: u64,
    pub vm_cpu_count: u32,
}

impl Default for HypervConfig {
    fn default() -> Self {
        Self {
            template_path: None,
            storage_path: None,
            vm_username: None,
            vm_password: None,
            vm_memory_mb: 4096,
            vm_cpu_count: 2,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_seconds: u64,
    pub creation_timeout_minutes: u64,
    pub grace_period_minutes: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            creation_timeout_minutes: 5,
            grace_period_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub use_mock: bool,
}

impl FileConfig {
    /// Read, parse and validate the configuration file. Any failure here is
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.runners.cache_url
            && !url.ends_with('/')
        {
            return Err(ConfigError::CacheUrlMissingSlash);
        }

        if self.debug.use_mock {
            return Ok(());
        }

        if self.github.app_id.is_none() {
            return Err(ConfigError::MissingAppId);
        }
        match &self.github.app_private_key_path {
            None => return Err(ConfigError::MissingPrivateKey),
            Some(path) if !path.exists() => {
                return Err(ConfigError::PrivateKeyNotFound(path.clone()));
            }
            Some(_) => {}
        }
        if self.github.org.is_some() && self.github.user.is_some() {
            return Err(ConfigError::AmbiguousAccount);
        }
        self.runner_scope()?;

        if self.hyperv.template_path.is_none() {
            return Err(ConfigError::MissingTemplatePath);
        }
        if self.hyperv.storage_path.is_none() {
            return Err(ConfigError::MissingStoragePath);
        }
        if self.hyperv.vm_username.is_none() || self.hyperv.vm_password.is_none() {
            return Err(ConfigError::MissingGuestCredentials);
        }
        Ok(())
    }

    /// Registration scope for the identity client.
    pub fn runner_scope(&self) -> Result<RunnerScope, ConfigError> {
        if self.github.org.is_none() && self.github.user.is_none() {
            return Err(ConfigError::MissingAccount);
        }
        Ok(RunnerScope::resolve(
            self.github.org.as_deref(),
            self.github.user.as_deref(),
            self.github.repo.as_deref(),
        )?)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let account = self
            .github
            .org
            .clone()
            .or_else(|| self.github.user.clone())
            .unwrap_or_else(|| "mock".into());
        PoolConfig {
            size: self.runners.pool_size,
            name_prefix: self.runners.name_prefix.clone(),
            labels: self.runners.labels.clone(),
            runner_group: self.runners.runner_group.clone(),
            cache_url: self.runners.cache_url.clone(),
            account,
            repository: self.github.repo.clone(),
            health_check_interval: Duration::from_secs(
                self.monitoring.health_check_interval_seconds,
            ),
            creation_timeout: Duration::from_secs(self.monitoring.creation_timeout_minutes * 60),
            grace_period: Duration::from_secs(self.monitoring.grace_period_minutes * 60),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn driver_config(&self) -> Result<HyperVDriverConfig, ConfigError> {
        Ok(HyperVDriverConfig {
            template_path: self
                .hyperv
                .template_path
                .clone()
                .ok_or(ConfigError::MissingTemplatePath)?,
            storage_dir: self
                .hyperv
                .storage_path
                .clone()
                .ok_or(ConfigError::MissingStoragePath)?,
            switch_name: SWITCH_NAME.into(),
            vm_username: self
                .hyperv
                .vm_username
                .clone()
                .ok_or(ConfigError::MissingGuestCredentials)?,
            vm_password: self
                .hyperv
                .vm_password
                .clone()
                .ok_or(ConfigError::MissingGuestCredentials)?,
            memory_mb: self.hyperv.vm_memory_mb,
            cpu_count: self.hyperv.vm_cpu_count,
        })
    }
}
