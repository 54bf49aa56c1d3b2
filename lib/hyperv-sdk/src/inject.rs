//! Offline configuration injection into a cloned child disk.
//!
//! The image must be unmounted before the VM starts; a mounted image blocks
//! boot. Every exit path below releases the mount.

use std::path::{Path, PathBuf};
use std::time::Duration;

use shared::runner::{RUNNER_CONFIG_FILE_NAME, RunnerConfig};

use crate::powershell::{self, PowerShellError, quote};

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("encoding runner config: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("mounting image: {0}")]
    Mount(#[source] PowerShellError),

    #[error("image has no basic partition")]
    NoPartition,

    #[error("selecting target partition: {0}")]
    Partition(#[source] PowerShellError),

    #[error("writing staging file {path}: {source}")]
    Stage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("copying config into image: {0}")]
    Copy(#[source] PowerShellError),

    #[error("injected config failed verification")]
    Verify,

    #[error("dismounting image: {0}")]
    Dismount(#[source] PowerShellError),
}

const PS_TIMEOUT: Duration = Duration::from_secs(60);

/// Write `config` to `<root>:\runner-config.json` on the image's main
/// partition.
pub(crate) async fn inject_config(image: &Path, config: &RunnerConfig) -> Result<(), InjectError> {
    let payload = config.to_json_bytes()?;
    let image_arg = quote(&image.display().to_string());

    powershell::run(
        &format!("Mount-VHD -Path {image_arg} | Out-Null"),
        PS_TIMEOUT,
    )
    .await
    .map_err(InjectError::Mount)?;

    let written = write_config(&image_arg, config, &payload).await;

    let dismounted = powershell::run(&format!("Dismount-VHD -Path {image_arg}"), PS_TIMEOUT).await;

    written?;
    dismounted.map_err(InjectError::Dismount)?;
    Ok(())
}

async fn write_config(
    image_arg: &str,
    config: &RunnerConfig,
    payload: &[u8],
) -> Result<(), InjectError> {
    // Target partition: the largest basic partition that already has a drive
    // letter, else the largest basic partition after assigning one.
    let select = format!(
        "$disk = Get-VHD -Path {image_arg}\n\
         $parts = Get-Partition -DiskNumber $disk.DiskNumber | Where-Object {{ $_.Type -eq 'Basic' }} | Sort-Object -Property Size -Descending\n\
         if (-not $parts) {{ Write-Output 'NOPART'; exit 0 }}\n\
         $target = $parts | Where-Object {{ $_.DriveLetter }} | Select-Object -First 1\n\
         if (-not $target) {{\n\
             $target = $parts | Select-Object -First 1\n\
             $target | Add-PartitionAccessPath -AssignDriveLetter | Out-Null\n\
             $target = Get-Partition -DiskNumber $disk.DiskNumber -PartitionNumber $target.PartitionNumber\n\
         }}\n\
         Write-Output $target.DriveLetter"
    );
    let letter = powershell::run(&select, PS_TIMEOUT)
        .await
        .map_err(InjectError::Partition)?;
    if letter == "NOPART" {
        return Err(InjectError::NoPartition);
    }

    // Per-slot staging file name, parallel creations do not collide.
    let staging = std::env::temp_dir().join(format!("runner-config-{}.json", config.name));
    tokio::fs::write(&staging, payload)
        .await
        .map_err(|source| InjectError::Stage {
            path: staging.clone(),
            source,
        })?;

    let staging_arg = quote(&staging.display().to_string());
    let dest_arg = quote(&format!("{letter}:\\{RUNNER_CONFIG_FILE_NAME}"));
    let copy = format!(
        "Copy-Item -Path {staging_arg} -Destination {dest_arg} -Force\n\
         $written = Get-Item -Path {dest_arg}\n\
         $head = [System.IO.File]::ReadAllText({dest_arg}).Substring(0, 2)\n\
         if ($written.Length -eq {len} -and $head -eq '{{\"') {{ Write-Output 'SUCCESS' }}",
        len = payload.len(),
    );
    let copied = powershell::run(&copy, PS_TIMEOUT).await;

    let _ = tokio::fs::remove_file(&staging).await;

    if copied.map_err(InjectError::Copy)? != "SUCCESS" {
        return Err(InjectError::Verify);
    }
    Ok(())
}
