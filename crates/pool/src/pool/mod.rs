//! The pool reconciler: owns the slot array and drives each slot through
//! create, monitor and recreate.

pub mod monitor;
pub mod slot;
pub mod sweeper;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use hyperv_sdk::{DriverError, HypervisorDriver};
use shared::names::slot_name;
use shared::runner::{RunnerConfig, join_labels};
use tokio::sync::watch;

use crate::identity::{IdentityClient, IdentityError};
use slot::{DestroyClaim, Slot, SlotError};

/// Process-wide pool parameters, immutable after configuration load.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub name_prefix: String,
    pub labels: Vec<String>,
    pub runner_group: Option<String>,
    pub cache_url: Option<String>,
    pub account: String,
    pub repository: Option<String>,
    pub health_check_interval: Duration,
    pub creation_timeout: Duration,
    pub grace_period: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no such slot: {0}")]
    NoSuchSlot(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("{failed} of {total} slots failed: {details}")]
    Aggregate {
        failed: usize,
        total: usize,
        details: String,
    },
}

pub struct Pool {
    config: PoolConfig,
    driver: Arc<dyn HypervisorDriver>,
    identity: Arc<dyn IdentityClient>,
    slots: Vec<Arc<Slot>>,
    shutdown: watch::Sender<bool>,
    shutting_down: AtomicBool,
    // Serializes admin fan-outs; never held across driver or identity calls
    // for a single slot.
    admin_lock: tokio::sync::Mutex<()>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn HypervisorDriver>,
        identity: Arc<dyn IdentityClient>,
    ) -> Arc<Self> {
        let slots = (1..=config.size)
            .map(|ordinal| Arc::new(Slot::new(slot_name(&config.name_prefix, ordinal))))
            .collect();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            driver,
            identity,
            slots,
            shutdown,
            shutting_down: AtomicBool::new(false),
            admin_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|slot| slot.name() == name)
    }

    pub(crate) fn driver(&self) -> &dyn HypervisorDriver {
        self.driver.as_ref()
    }

    pub(crate) fn identity(&self) -> &dyn IdentityClient {
        self.identity.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Sweep leftovers, then bring every slot up in parallel.
    ///
    /// Per-slot failures are logged and do not abort the process: surviving
    /// slots keep serving, failed ones stay non-ready and are picked up by
    /// their monitors.
    pub async fn initialize(self: &Arc<Self>) {
        tracing::info!(
            size = self.config.size,
            prefix = %self.config.name_prefix,
            "initializing pool"
        );

        if let Err(error) = self.driver.cleanup_leftover(&self.config.name_prefix).await {
            tracing::warn!(
                component = "sweeper",
                operation = "cleanup_leftover",
                %error,
                "startup local sweep failed"
            );
        }
        if let Err(error) =
            sweeper::sweep_registry(self.identity.as_ref(), &self.config.name_prefix).await
        {
            tracing::warn!(
                component = "sweeper",
                operation = "sweep_registry",
                %error,
                "startup registry sweep failed"
            );
        }

        let results = join_all(self.slots.iter().map(|slot| {
            let pool = Arc::clone(self);
            let slot = Arc::clone(slot);
            async move { pool.create_and_register(slot).await }
        }))
        .await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        tracing::info!(
            ready = self.slots.len() - failed,
            failed,
            "pool initialized"
        );
    }

    /// Create the slot's VM under a fresh monitor.
    ///
    /// The monitor starts as soon as the slot enters `Creating`, so a hung
    /// or failed creation is recovered by the creation timeout. It is also
    /// the sole recovery path after a failed creation.
    fn create_and_register<'a>(
        self: &'a Arc<Self>,
        slot: Arc<Slot>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), PoolError>> + Send + 'a>>
    {
        Box::pin(async move {
            let generation = slot.begin_creating()?;
            if !self.is_shutting_down() {
                tokio::spawn(Box::pin(monitor::run(
                    Arc::clone(self),
                    Arc::clone(&slot),
                    generation,
                )));
            }

            let result = self.create_slot_vm(&slot, generation).await;
            if let Err(error) = &result {
                tracing::error!(
                    component = "pool",
                    operation = "create",
                    vm_name = slot.name(),
                    %error,
                    "slot creation failed"
                );
            }
            result
        })
    }

    async fn create_slot_vm(&self, slot: &Arc<Slot>, generation: u64) -> Result<(), PoolError> {
        let registration = self.identity.issue_registration_token().await?;
        slot.set_token(registration.token.clone());
        let runner = self.runner_config(slot.name(), registration.token);

        let created = self.driver.create_vm(slot.name(), &runner).await;
        // The token is inside the image now (or creation failed); either way
        // we have no further use for it.
        slot.clear_token();
        created?;

        slot.mark_ready(generation)?;
        tracing::info!(
            component = "pool",
            operation = "create",
            vm_name = slot.name(),
            "slot ready"
        );
        Ok(())
    }

    fn runner_config(&self, name: &str, token: String) -> RunnerConfig {
        RunnerConfig {
            token,
            account: self.config.account.clone(),
            repository: self.config.repository.clone(),
            name: name.to_string(),
            labels: join_labels(&self.config.labels),
            // Runner groups only exist for account-scoped runners.
            runner_group: match self.config.repository {
                None => self.config.runner_group.clone(),
                Some(_) => None,
            },
            cache_url: self.config.cache_url.clone(),
        }
    }

    /// Tear down and re-create the named slot's VM.
    pub async fn recreate_vm(self: &Arc<Self>, name: &str) -> Result<(), PoolError> {
        let slot = self
            .slot(name)
            .cloned()
            .ok_or_else(|| PoolError::NoSuchSlot(name.to_string()))?;
        self.recreate_slot(slot, "admin request").await
    }

    pub(crate) async fn recreate_slot(
        self: &Arc<Self>,
        slot: Arc<Slot>,
        reason: &str,
    ) -> Result<(), PoolError> {
        if self.is_shutting_down() {
            return Ok(());
        }
        match slot.begin_destroying() {
            DestroyClaim::AlreadyDestroying => return Ok(()),
            DestroyClaim::NothingToDestroy => {}
            DestroyClaim::Claimed => {
                tracing::info!(
                    component = "pool",
                    operation = "recreate",
                    vm_name = slot.name(),
                    reason,
                    "recreating vm"
                );
                // A stuck VM must never block replacement.
                if let Err(error) = self.driver.destroy_vm(slot.name()).await {
                    tracing::warn!(
                        component = "pool",
                        operation = "destroy",
                        vm_name = slot.name(),
                        %error,
                        "destroy failed; continuing with recreation"
                    );
                }
            }
        }
        self.create_and_register(slot).await
    }

    /// Recreate every slot in parallel. Serialized against other admin ops
    /// by the pool lock.
    pub async fn restart_all(self: &Arc<Self>) -> Result<(), PoolError> {
        let _admin = self.admin_lock.lock().await;
        let results = join_all(self.slots.iter().map(|slot| {
            let pool = Arc::clone(self);
            let slot = Arc::clone(slot);
            async move {
                let name = slot.name().to_string();
                (name, pool.recreate_slot(slot, "restart all").await)
            }
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|error| format!("{name}: {error}")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Aggregate {
                failed: failures.len(),
                total: self.slots.len(),
                details: failures.join("; "),
            })
        }
    }

    /// One-shot, idempotent shutdown: stop the monitors, then sweep the
    /// registry and local resources.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        // Give monitors a beat to observe the cancellation.
        tokio::time::sleep(self.config.shutdown_grace).await;

        // Registry first, so stale records are gone before the VMs are.
        let registry =
            sweeper::sweep_registry(self.identity.as_ref(), &self.config.name_prefix).await;
        let local = self.driver.cleanup_leftover(&self.config.name_prefix).await;

        if let Err(error) = &registry {
            tracing::warn!(
                component = "sweeper",
                operation = "sweep_registry",
                %error,
                "shutdown registry sweep failed"
            );
        }
        if let Err(error) = &local {
            tracing::warn!(
                component = "sweeper",
                operation = "cleanup_leftover",
                %error,
                "shutdown local sweep failed"
            );
        }

        registry?;
        local?;
        Ok(())
    }
}
