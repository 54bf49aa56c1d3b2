//! End-to-end pool scenarios on the mock driver and mock identity.
//!
//! Cadences are shrunk to milliseconds; assertions that depend on monitor
//! ticks poll with a generous deadline instead of sleeping fixed amounts.

use std::sync::Arc;
use std::time::Duration;

use hyperv_sdk::{HypervisorDriver, MockDriver, PowerState};
use runner_pool::identity::{IdentityClient, MockIdentity};
use runner_pool::pool::slot::SlotState;
use runner_pool::pool::{Pool, PoolConfig, PoolError};

fn test_config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        name_prefix: "r-".into(),
        labels: vec!["smoke".into()],
        runner_group: None,
        cache_url: None,
        account: "acme".into(),
        repository: None,
        health_check_interval: Duration::from_millis(50),
        creation_timeout: Duration::from_millis(300),
        // Large enough that registry health checks stay out of the way
        // unless a test opts in.
        grace_period: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(50),
    }
}

struct Harness {
    pool: Arc<Pool>,
    driver: Arc<MockDriver>,
    identity: Arc<MockIdentity>,
}

fn harness(config: PoolConfig) -> Harness {
    let driver = Arc::new(MockDriver::new());
    let identity = Arc::new(MockIdentity::new());
    let registry = Arc::clone(&identity);
    driver.set_on_boot(move |name| registry.register_online(name));
    let pool = Pool::new(
        config,
        Arc::clone(&driver) as Arc<dyn HypervisorDriver>,
        Arc::clone(&identity) as Arc<dyn IdentityClient>,
    );
    Harness {
        pool,
        driver,
        identity,
    }
}

async fn wait_until(what: &str, deadline: Duration, mut predicate: impl FnMut() -> bool) {
    let give_up = tokio::time::Instant::now() + deadline;
    while !predicate() {
        if tokio::time::Instant::now() > give_up {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_up_brings_every_slot_ready() {
    let h = harness(test_config(3));
    h.pool.initialize().await;

    assert_eq!(h.driver.vm_names(), vec!["r-1", "r-2", "r-3"]);
    for slot in h.pool.slots() {
        assert_eq!(slot.state(), SlotState::Ready, "slot {}", slot.name());
    }

    let injected = h.driver.vm("r-2").unwrap().config.unwrap();
    assert_eq!(injected.name, "r-2");
    assert_eq!(injected.account, "acme");
    assert!(injected.token.starts_with("mock-"));
    assert_eq!(injected.labels, "self-hosted,Windows,X64,ephemeral,smoke");

    // Registration tokens are discarded once they are inside the image.
    assert!(h.pool.slot("r-2").unwrap().token().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn wide_pools_initialize_in_parallel() {
    let h = harness(test_config(8));
    h.pool.initialize().await;

    let expected: Vec<String> = (1..=8).map(|n| format!("r-{n}")).collect();
    let mut names = h.driver.vm_names();
    names.sort_by_key(|name| name[2..].parse::<u32>().unwrap());
    assert_eq!(names, expected);
    for slot in h.pool.slots() {
        assert_eq!(slot.state(), SlotState::Ready, "slot {}", slot.name());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn powered_off_vm_is_recycled() {
    let h = harness(test_config(3));
    h.pool.initialize().await;

    let before = h.driver.vm("r-2").unwrap().boot_id;
    assert!(h.driver.set_power("r-2", PowerState::Off));

    wait_until("r-2 to be recreated", Duration::from_secs(5), || {
        h.driver
            .vm("r-2")
            .is_some_and(|vm| vm.boot_id != before && vm.power == PowerState::Running)
    })
    .await;
    wait_until("r-2 to settle ready", Duration::from_secs(5), || {
        h.pool.slot("r-2").unwrap().state() == SlotState::Ready
    })
    .await;

    assert_eq!(h.driver.vm_names(), vec!["r-1", "r-2", "r-3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_all_replaces_every_vm() {
    let h = harness(test_config(3));
    h.pool.initialize().await;

    let before: Vec<u64> = ["r-1", "r-2", "r-3"]
        .iter()
        .map(|name| h.driver.vm(name).unwrap().boot_id)
        .collect();

    h.pool.restart_all().await.unwrap();

    assert_eq!(h.driver.vm_names(), vec!["r-1", "r-2", "r-3"]);
    for (name, old) in ["r-1", "r-2", "r-3"].iter().zip(before) {
        assert_ne!(h.driver.vm(name).unwrap().boot_id, old, "vm {name}");
    }
    for slot in h.pool.slots() {
        assert_eq!(slot.state(), SlotState::Ready, "slot {}", slot.name());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_sweep_removes_leftovers_but_spares_non_pool_names() {
    let h = harness(test_config(3));
    h.driver.insert_vm("r-1", PowerState::Running);
    h.driver.insert_vm("r-2", PowerState::Off);
    h.driver.insert_vm("r-9", PowerState::Running);
    h.driver.insert_vm("r-basic", PowerState::Running);
    h.identity.register_online("r-9");
    h.identity.register_online("r-basic");

    h.pool.initialize().await;

    // Leftover pool-shaped VMs were swept and replaced by the new
    // incarnations; r-basic does not match the digit rule and survives.
    assert_eq!(h.driver.vm_names(), vec!["r-1", "r-2", "r-3", "r-basic"]);
    assert_eq!(
        h.identity.runner_names(),
        vec!["r-1", "r-2", "r-3", "r-basic"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn hung_creation_is_recovered_by_the_watchdog() {
    let mut config = test_config(1);
    config.creation_timeout = Duration::from_millis(200);
    let h = harness(config);
    h.driver.hang_next_create("r-1");

    let pool = Arc::clone(&h.pool);
    tokio::spawn(async move { pool.initialize().await });

    wait_until("r-1 to recover from the hang", Duration::from_secs(5), || {
        h.pool.slot("r-1").is_some_and(|slot| slot.state() == SlotState::Ready)
            && h.driver.vm("r-1").is_some()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_creation_timeout_does_not_outpace_the_monitor() {
    let mut config = test_config(1);
    config.creation_timeout = Duration::from_millis(0);
    let h = harness(config);
    h.driver.hang_next_create("r-1");

    let pool = Arc::clone(&h.pool);
    tokio::spawn(async move { pool.initialize().await });

    wait_until("r-1 to recover", Duration::from_secs(5), || {
        h.pool.slot("r-1").is_some_and(|slot| slot.state() == SlotState::Ready)
    })
    .await;

    // A ready slot is not churned by the zero timeout: recreation is driven
    // by the health-check cadence, not a busy loop.
    let settled = h.driver.vm("r-1").unwrap().boot_id;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.driver.vm("r-1").unwrap().boot_id, settled);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_runner_is_recycled_after_grace() {
    let mut config = test_config(1);
    config.grace_period = Duration::from_millis(100);
    let h = harness(config);
    h.pool.initialize().await;

    let before = h.driver.vm("r-1").unwrap().boot_id;
    h.identity.set_status("r-1", "offline");

    wait_until("r-1 to be replaced", Duration::from_secs(5), || {
        h.driver.vm("r-1").is_some_and(|vm| vm.boot_id != before)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_clears_vms_and_registry() {
    let h = harness(test_config(3));
    h.pool.initialize().await;
    assert_eq!(h.identity.runner_names().len(), 3);

    h.pool.shutdown().await.unwrap();

    assert!(h.driver.vm_names().is_empty());
    assert!(h.identity.runner_names().is_empty());

    // Idempotent: a second shutdown is a no-op.
    h.pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_pool_starts_sweeps_and_shuts_down() {
    let h = harness(test_config(0));
    h.driver.insert_vm("r-7", PowerState::Off);

    h.pool.initialize().await;
    assert!(h.pool.slots().is_empty());
    // The startup sweep still ran.
    assert!(h.driver.vm_names().is_empty());

    h.pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recreate_is_idempotent_and_checks_the_name() {
    let h = harness(test_config(2));
    h.pool.initialize().await;

    h.pool.recreate_vm("r-1").await.unwrap();
    h.pool.recreate_vm("r-1").await.unwrap();

    assert_eq!(h.pool.slot("r-1").unwrap().state(), SlotState::Ready);
    assert_eq!(h.driver.vm_names(), vec!["r-1", "r-2"]);

    assert!(matches!(
        h.pool.recreate_vm("r-7").await,
        Err(PoolError::NoSuchSlot(_))
    ));
}
