//! Hyper-V implementation of the driver, shelling out to the management CLI.

use std::path::PathBuf;
use std::time::Duration;

use shared::names::is_pool_member;
use shared::runner::RunnerConfig;
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};

use crate::driver::{DriverError, HypervisorDriver, PowerState};
use crate::inject;
use crate::powershell::{self, quote};

/// Path of the one-shot bootstrap script baked into the template image.
const GUEST_BOOTSTRAP_SCRIPT: &str = r"C:\runner\bootstrap.ps1";

/// Attempts to reach the guest over PowerShell Direct before giving up.
const BOOTSTRAP_ATTEMPTS: usize = 15;

const PS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct HyperVDriverConfig {
    /// Read-only template image every child disk diffs against.
    pub template_path: PathBuf,
    /// Directory holding the per-slot child disks.
    pub storage_dir: PathBuf,
    /// Virtual switch the runner NIC attaches to.
    pub switch_name: String,
    pub vm_username: String,
    pub vm_password: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
}

pub struct HyperVDriver {
    config: HyperVDriverConfig,
    // The mount subsystem is a host-wide resource; every Mount-VHD and
    // Dismount-VHD in this file runs under this lock.
    mount_lock: tokio::sync::Mutex<()>,
}

impl HyperVDriver {
    pub fn new(config: HyperVDriverConfig) -> Self {
        Self {
            config,
            mount_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn child_disk_path(&self, name: &str) -> PathBuf {
        self.config.storage_dir.join(format!("{name}.vhdx"))
    }

    /// Run the bootstrap script in the guest over PowerShell Direct,
    /// retrying with backoff until the guest accepts the connection.
    async fn bootstrap_guest(&self, name: &str) -> Result<(), powershell::PowerShellError> {
        let name_arg = quote(name);
        let user_arg = quote(&self.config.vm_username);
        let pass_arg = quote(&self.config.vm_password);
        let script = format!(
            "$pass = ConvertTo-SecureString {pass_arg} -AsPlainText -Force\n\
             $cred = New-Object System.Management.Automation.PSCredential({user_arg}, $pass)\n\
             Invoke-Command -VMName {name_arg} -Credential $cred -ScriptBlock {{ & {GUEST_BOOTSTRAP_SCRIPT} }}",
        );

        let strategy = ExponentialBackoff::from_millis(2_000)
            .max_delay(Duration::from_secs(15))
            .map(jitter)
            .take(BOOTSTRAP_ATTEMPTS);

        Retry::spawn(strategy, || powershell::run(&script, PS_TIMEOUT)).await?;
        Ok(())
    }

    async fn destroy_by_name(&self, name: &str) -> Result<(), DriverError> {
        let name_arg = quote(name);

        // Force power-off; a VM that is already off or already gone is fine.
        if let Err(err) = powershell::run(
            &format!("Stop-VM -Name {name_arg} -TurnOff -Force"),
            PS_TIMEOUT,
        )
        .await
        {
            tracing::debug!(vm_name = name, error = %err, "force power-off failed");
        }

        // Removing the record is fatal, except when the record is gone.
        match powershell::run(&format!("Remove-VM -Name {name_arg} -Force"), PS_TIMEOUT).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(source) => {
                return Err(DriverError::Destroy {
                    name: name.to_string(),
                    source,
                });
            }
        }

        // The child disk may still be mounted from a failed injection.
        let child = self.child_disk_path(name);
        let child_arg = quote(&child.display().to_string());
        {
            let _mount = self.mount_lock.lock().await;
            let _ = powershell::run(&format!("Dismount-VHD -Path {child_arg}"), PS_TIMEOUT).await;
        }

        match tokio::fs::remove_file(&child).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DriverError::DiskRemove {
                path: child,
                source,
            }),
        }
    }
}

#[async_trait::async_trait]
impl HypervisorDriver for HyperVDriver {
    async fn create_vm(&self, name: &str, config: &RunnerConfig) -> Result<(), DriverError> {
        let child = self.child_disk_path(name);
        let child_arg = quote(&child.display().to_string());
        let template_arg = quote(&self.config.template_path.display().to_string());
        let name_arg = quote(name);

        powershell::run(
            &format!("New-VHD -Path {child_arg} -ParentPath {template_arg} -Differencing | Out-Null"),
            PS_TIMEOUT,
        )
        .await
        .map_err(|source| DriverError::Clone {
            name: name.to_string(),
            source,
        })?;

        {
            let _mount = self.mount_lock.lock().await;
            inject::inject_config(&child, config)
                .await
                .map_err(|source| DriverError::Inject {
                    name: name.to_string(),
                    source,
                })?;
        }

        let switch_arg = quote(&self.config.switch_name);
        let define = format!(
            "New-VM -Name {name_arg} -Generation 2 -MemoryStartupBytes {mem} -VHDPath {child_arg} -SwitchName {switch_arg} | Out-Null\n\
             Set-VM -Name {name_arg} -ProcessorCount {cpus} -AutomaticStartAction Nothing -AutomaticStopAction ShutDown -CheckpointType Disabled\n\
             Set-VMFirmware -VMName {name_arg} -FirstBootDevice (Get-VMHardDiskDrive -VMName {name_arg})",
            mem = self.config.memory_mb * 1024 * 1024,
            cpus = self.config.cpu_count,
        );
        powershell::run(&define, PS_TIMEOUT)
            .await
            .map_err(|source| DriverError::Define {
                name: name.to_string(),
                source,
            })?;

        powershell::run(&format!("Start-VM -Name {name_arg}"), PS_TIMEOUT)
            .await
            .map_err(|source| DriverError::Start {
                name: name.to_string(),
                source,
            })?;

        self.bootstrap_guest(name)
            .await
            .map_err(|source| DriverError::Bootstrap {
                name: name.to_string(),
                source,
            })
    }

    async fn destroy_vm(&self, name: &str) -> Result<(), DriverError> {
        self.destroy_by_name(name).await
    }

    async fn power_state(&self, name: &str) -> Result<PowerState, DriverError> {
        let name_arg = quote(name);
        match powershell::run(&format!("(Get-VM -Name {name_arg}).State"), PS_TIMEOUT).await {
            Ok(state) => Ok(PowerState::from(state.as_str())),
            Err(err) if err.is_not_found() => Ok(PowerState::Unknown),
            Err(source) => Err(DriverError::PowerState {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn cleanup_leftover(&self, prefix: &str) -> Result<(), DriverError> {
        let names = powershell::run("Get-VM | Select-Object -ExpandProperty Name", PS_TIMEOUT)
            .await
            .map_err(|source| DriverError::Cleanup { source })?;

        for name in names.lines().map(str::trim) {
            if !is_pool_member(prefix, name) {
                continue;
            }
            if let Err(error) = self.destroy_by_name(name).await {
                tracing::warn!(vm_name = name, %error, "failed to remove leftover vm");
            }
        }

        // Disks left behind without a VM record.
        let storage = &self.config.storage_dir;
        let scan_err = |source: std::io::Error| DriverError::CleanupScan {
            path: storage.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(storage).await.map_err(&scan_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(&scan_err)? {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(".vhdx"))
            else {
                continue;
            };
            if !is_pool_member(prefix, stem) {
                continue;
            }

            let path = entry.path();
            let path_arg = quote(&path.display().to_string());
            {
                let _mount = self.mount_lock.lock().await;
                let _ = powershell::run(&format!("Dismount-VHD -Path {path_arg}"), PS_TIMEOUT)
                    .await;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to remove leftover disk");
                }
            }
        }

        Ok(())
    }
}
