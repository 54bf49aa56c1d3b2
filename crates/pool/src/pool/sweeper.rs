//! Registry-side pool sweep.
//!
//! The process keeps no durable state; the world is the source of truth.
//! Sweeps restore the invariant that the only registry records matching the
//! pool's naming scheme are the ones the pool currently owns.

use shared::names::is_pool_member;

use crate::identity::{IdentityClient, IdentityError};

/// Deregister every runner whose name matches the pool shape, online or not.
/// A quick restart can leave stale "online" records that would collide on
/// re-registration.
pub(crate) async fn sweep_registry(
    identity: &dyn IdentityClient,
    prefix: &str,
) -> Result<usize, IdentityError> {
    let runners = identity.list_runners().await?;

    let mut removed = 0usize;
    let mut first_error = None;
    for runner in runners
        .into_iter()
        .filter(|runner| is_pool_member(prefix, &runner.name))
    {
        match identity.deregister_runner(runner.id).await {
            Ok(()) => {
                removed += 1;
                tracing::info!(
                    component = "sweeper",
                    operation = "deregister",
                    vm_name = %runner.name,
                    id = runner.id,
                    "deregistered stale runner"
                );
            }
            Err(error) => {
                tracing::warn!(
                    component = "sweeper",
                    operation = "deregister",
                    vm_name = %runner.name,
                    id = runner.id,
                    %error,
                    "failed to deregister runner"
                );
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentity;

    #[tokio::test]
    async fn sweep_removes_only_pool_shaped_names() {
        let identity = MockIdentity::new();
        identity.register_online("r-1");
        identity.register_online("r-9");
        identity.register_online("r-basic");
        identity.register_online("other");

        let removed = sweep_registry(&identity, "r-").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(identity.runner_names(), vec!["other", "r-basic"]);
    }

    #[tokio::test]
    async fn sweep_removes_offline_records_too() {
        let identity = MockIdentity::new();
        identity.register_online("r-1");
        identity.set_status("r-1", "offline");

        let removed = sweep_registry(&identity, "r-").await.unwrap();
        assert_eq!(removed, 1);
        assert!(identity.runner_names().is_empty());
    }
}
