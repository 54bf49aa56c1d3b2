//! Per-slot periodic health checks.
//!
//! One cooperative task per slot incarnation, spawned when the slot enters
//! `Creating`. When a check decides the VM is done for, the monitor spawns a
//! detached recreation task and exits; the replacement incarnation brings
//! its own monitor.

use std::sync::Arc;

use crate::pool::Pool;
use crate::pool::slot::{Slot, SlotState};

enum Tick {
    Healthy,
    /// Not conclusive this round; check again next tick.
    Pending,
    Recreate(&'static str),
}

pub(crate) async fn run(pool: Arc<Pool>, slot: Arc<Slot>, generation: u64) {
    let mut shutdown = pool.shutdown_signal();
    let interval = pool.config().health_check_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        if pool.is_shutting_down() {
            return;
        }
        // A newer incarnation owns the slot; its own monitor takes over.
        if slot.generation() != generation {
            return;
        }

        match tick(&pool, &slot).await {
            Tick::Healthy | Tick::Pending => {}
            Tick::Recreate(reason) => {
                let pool = Arc::clone(&pool);
                let slot = Arc::clone(&slot);
                tokio::spawn(async move {
                    if let Err(error) = pool.recreate_slot(slot, reason).await {
                        tracing::error!(
                            component = "monitor",
                            operation = "recreate",
                            %error,
                            "recreation failed"
                        );
                    }
                });
                return;
            }
        }
    }
}

async fn tick(pool: &Arc<Pool>, slot: &Arc<Slot>) -> Tick {
    let name = slot.name();

    // A claimed teardown owns the VM name; stand down until the next
    // incarnation's monitor takes over.
    if slot.state() == SlotState::Destroying {
        return Tick::Pending;
    }

    // While the slot is still being created only the watchdog applies: the
    // VM legitimately sits powered off between define and start, and the
    // runner has not had a chance to register yet.
    if slot.state() == SlotState::Creating {
        if slot
            .since_created()
            .is_some_and(|elapsed| elapsed > pool.config().creation_timeout)
        {
            return Tick::Recreate("creation timeout");
        }
        return Tick::Pending;
    }

    // An Off or Stopped VM means the guest ran its single job and shut
    // itself down; that is the normal end of a cycle.
    match pool.driver().power_state(name).await {
        Ok(state) if state.is_halted() => return Tick::Recreate("power off"),
        Ok(_) => {}
        Err(error) => {
            let failures = slot.note_health_failure();
            tracing::debug!(
                component = "monitor",
                operation = "power_state",
                vm_name = name,
                %error,
                failures,
                "transient driver error"
            );
            // Transient driver errors never trigger recreation on their own.
            return Tick::Pending;
        }
    }

    // Registry checks only make sense once the runner has had time to
    // register and pick up work.
    if slot
        .since_created()
        .is_some_and(|elapsed| elapsed > pool.config().grace_period)
    {
        match pool.identity().list_runners().await {
            Ok(runners) => match runners.iter().find(|runner| runner.name == name) {
                None => return Tick::Recreate("missing in registry"),
                Some(runner) if runner.status != "online" => {
                    return Tick::Recreate("offline in registry");
                }
                Some(_) => slot.note_health_ok(),
            },
            Err(error) => {
                let failures = slot.note_health_failure();
                tracing::debug!(
                    component = "monitor",
                    operation = "list_runners",
                    vm_name = name,
                    %error,
                    failures,
                    "transient identity error"
                );
                return Tick::Pending;
            }
        }
    }

    Tick::Healthy
}
