//! Thin wrapper over `powershell.exe` invocations.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum PowerShellError {
    #[error("failed to spawn powershell: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("powershell did not finish within {0:?}")]
    Timeout(Duration),

    #[error("powershell exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

impl PowerShellError {
    /// Whether the failure reported a missing VM or file rather than a real
    /// fault. Destroy paths treat these as already done.
    pub fn is_not_found(&self) -> bool {
        match self {
            PowerShellError::Failed { stderr, .. } => {
                stderr.contains("ObjectNotFound")
                    || stderr.contains("Unable to find")
                    || stderr.contains("was not found")
                    || stderr.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// Run a script with `-NoProfile -NonInteractive` and return trimmed stdout.
///
/// The process is killed if the deadline elapses or the calling task is
/// cancelled.
pub(crate) async fn run(script: &str, deadline: Duration) -> Result<String, PowerShellError> {
    let child = Command::new("powershell.exe")
        .arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-Command")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match timeout(deadline, child.wait_with_output()).await {
        Err(_) => return Err(PowerShellError::Timeout(deadline)),
        Ok(output) => output?,
    };

    if !output.status.success() {
        return Err(PowerShellError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Single-quote a value for interpolation into a script.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
