//! Hyper-V SDK
//!
//! Drives a local Hyper-V host through its management CLI: differencing-disk
//! clones, offline configuration injection, VM definition and teardown, and
//! guest bootstrap over PowerShell Direct. An in-process mock backend with
//! the same capability surface backs tests and `use_mock` runs.
mod hyperv;
mod inject;
mod powershell;

pub mod driver;
pub mod mock;

pub use driver::{DriverError, HypervisorDriver, PowerState};
pub use hyperv::{HyperVDriver, HyperVDriverConfig};
pub use inject::InjectError;
pub use mock::MockDriver;
pub use powershell::PowerShellError;
