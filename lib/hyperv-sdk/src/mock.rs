//! In-process mock backend for tests and `use_mock` runs.
//!
//! The store stands in for the hypervisor's world state: VM names, power
//! states and whatever config was last injected. Tests pre-populate it to
//! simulate leftovers and flip power states to simulate completed jobs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use shared::names::is_pool_member;
use shared::runner::RunnerConfig;

use crate::driver::{DriverError, HypervisorDriver, PowerState};

type BootHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MockVm {
    pub power: PowerState,
    /// Config injected at creation; `None` for pre-populated leftovers.
    pub config: Option<RunnerConfig>,
    /// Monotonic id assigned per boot; a recreated VM gets a fresh one.
    pub boot_id: u64,
}

#[derive(Default)]
pub struct MockDriver {
    vms: Mutex<HashMap<String, MockVm>>,
    hang_on_create: Mutex<HashSet<String>>,
    boot_counter: AtomicU64,
    on_boot: Mutex<Option<BootHook>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` with the VM name every time a mock VM boots. Mock mode
    /// wires this to the mock identity so booted runners appear online.
    pub fn set_on_boot(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_boot.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Pre-populate a VM, as if left over from a previous incarnation.
    pub fn insert_vm(&self, name: &str, power: PowerState) {
        let boot_id = self.boot_counter.fetch_add(1, Ordering::Relaxed);
        self.vms.lock().unwrap().insert(
            name.to_string(),
            MockVm {
                power,
                config: None,
                boot_id,
            },
        );
    }

    /// Flip the power state of an existing VM. Returns false when absent.
    pub fn set_power(&self, name: &str, power: PowerState) -> bool {
        match self.vms.lock().unwrap().get_mut(name) {
            Some(vm) => {
                vm.power = power;
                true
            }
            None => false,
        }
    }

    pub fn vm(&self, name: &str) -> Option<MockVm> {
        self.vms.lock().unwrap().get(name).cloned()
    }

    /// Sorted snapshot of the store's VM names.
    pub fn vm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vms.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Make the next `create_vm` for `name` hang until its task is dropped.
    pub fn hang_next_create(&self, name: &str) {
        self.hang_on_create.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait::async_trait]
impl HypervisorDriver for MockDriver {
    async fn create_vm(&self, name: &str, config: &RunnerConfig) -> Result<(), DriverError> {
        if self.hang_on_create.lock().unwrap().remove(name) {
            std::future::pending::<()>().await;
        }

        let boot_id = self.boot_counter.fetch_add(1, Ordering::Relaxed);
        self.vms.lock().unwrap().insert(
            name.to_string(),
            MockVm {
                power: PowerState::Running,
                config: Some(config.clone()),
                boot_id,
            },
        );

        let hook = self.on_boot.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(name);
        }
        Ok(())
    }

    async fn destroy_vm(&self, name: &str) -> Result<(), DriverError> {
        self.vms.lock().unwrap().remove(name);
        Ok(())
    }

    async fn power_state(&self, name: &str) -> Result<PowerState, DriverError> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .get(name)
            .map(|vm| vm.power)
            .unwrap_or(PowerState::Unknown))
    }

    async fn cleanup_leftover(&self, prefix: &str) -> Result<(), DriverError> {
        self.vms
            .lock()
            .unwrap()
            .retain(|name, _| !is_pool_member(prefix, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> RunnerConfig {
        RunnerConfig {
            token: "t".into(),
            account: "acme".into(),
            repository: None,
            name: name.into(),
            labels: "self-hosted".into(),
            runner_group: None,
            cache_url: None,
        }
    }

    #[tokio::test]
    async fn cleanup_only_touches_digit_suffixed_names() {
        let driver = MockDriver::new();
        driver.insert_vm("r-1", PowerState::Running);
        driver.insert_vm("r-9", PowerState::Off);
        driver.insert_vm("r-basic", PowerState::Running);
        driver.insert_vm("template", PowerState::Off);

        driver.cleanup_leftover("r-").await.unwrap();
        assert_eq!(driver.vm_names(), vec!["r-basic", "template"]);

        // Idempotent: a second sweep changes nothing.
        driver.cleanup_leftover("r-").await.unwrap();
        assert_eq!(driver.vm_names(), vec!["r-basic", "template"]);
    }

    #[tokio::test]
    async fn create_assigns_fresh_boot_ids() {
        let driver = MockDriver::new();
        driver.create_vm("r-1", &config("r-1")).await.unwrap();
        let first = driver.vm("r-1").unwrap().boot_id;

        driver.destroy_vm("r-1").await.unwrap();
        driver.create_vm("r-1", &config("r-1")).await.unwrap();
        assert_ne!(driver.vm("r-1").unwrap().boot_id, first);
    }

    #[tokio::test]
    async fn unknown_power_state_for_absent_vm() {
        let driver = MockDriver::new();
        assert_eq!(
            driver.power_state("nope").await.unwrap(),
            PowerState::Unknown
        );
    }

    #[tokio::test]
    async fn boot_hook_fires_on_create() {
        let driver = MockDriver::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        driver.set_on_boot(move |name| sink.lock().unwrap().push(name.to_string()));

        driver.create_vm("r-2", &config("r-2")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["r-2".to_string()]);
    }
}
