//! Capability surface every hypervisor backend exposes to the pool.

use std::path::PathBuf;

use shared::runner::RunnerConfig;

use crate::inject::InjectError;
use crate::powershell::PowerShellError;

/// Power state reported for a VM name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Off,
    Stopped,
    Starting,
    Stopping,
    Unknown,
}

impl PowerState {
    /// States that mean the guest finished its job and shut itself down.
    pub fn is_halted(self) -> bool {
        matches!(self, PowerState::Off | PowerState::Stopped)
    }
}

impl From<&str> for PowerState {
    fn from(state: &str) -> Self {
        match state {
            "Running" => PowerState::Running,
            "Off" => PowerState::Off,
            "Stopped" => PowerState::Stopped,
            "Starting" => PowerState::Starting,
            "Stopping" => PowerState::Stopping,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("cloning child disk for {name}: {source}")]
    Clone { name: String, source: PowerShellError },

    #[error("injecting runner config into {name}: {source}")]
    Inject { name: String, source: InjectError },

    #[error("defining vm {name}: {source}")]
    Define { name: String, source: PowerShellError },

    #[error("starting vm {name}: {source}")]
    Start { name: String, source: PowerShellError },

    #[error("bootstrapping guest {name}: {source}")]
    Bootstrap { name: String, source: PowerShellError },

    #[error("destroying vm {name}: {source}")]
    Destroy { name: String, source: PowerShellError },

    #[error("removing child disk {path}: {source}")]
    DiskRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("querying power state of {name}: {source}")]
    PowerState { name: String, source: PowerShellError },

    #[error("enumerating leftover vms: {source}")]
    Cleanup { source: PowerShellError },

    #[error("scanning storage directory {path}: {source}")]
    CleanupScan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Hypervisor backend contract.
///
/// One implementation shells out to the Hyper-V management CLI, another is
/// the in-process [`crate::MockDriver`]. Distinct VM names may be operated on
/// concurrently; the pool guarantees operations on the same name never
/// overlap.
#[async_trait::async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Clone a differencing child disk from the template, inject `config`
    /// into it, define and start the VM, then run the guest bootstrap script
    /// over the direct-execution channel.
    async fn create_vm(&self, name: &str, config: &RunnerConfig) -> Result<(), DriverError>;

    /// Force power-off, remove the VM record and delete the child disk.
    /// Idempotent: a VM or disk that is already gone is not an error.
    async fn destroy_vm(&self, name: &str) -> Result<(), DriverError>;

    /// Current power state, [`PowerState::Unknown`] when no such VM exists.
    async fn power_state(&self, name: &str) -> Result<PowerState, DriverError>;

    /// Remove every VM and child disk whose name is `prefix` followed by
    /// digits. Names not matching that shape are never touched.
    async fn cleanup_leftover(&self, prefix: &str) -> Result<(), DriverError>;
}
