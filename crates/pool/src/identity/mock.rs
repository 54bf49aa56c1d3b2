//! Synthetic registry for tests and `use_mock` runs. No network I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use super::{IdentityClient, IdentityError, RegisteredRunner, RegistrationToken};

fn monotonic_ns() -> u128 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos()
}

#[derive(Default)]
pub struct MockIdentity {
    runners: Mutex<Vec<RegisteredRunner>>,
    next_id: AtomicU64,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a runner as registered and online, replacing any previous
    /// record with the same name. The mock driver calls this when a mock VM
    /// boots, standing in for the guest's self-registration.
    pub fn register_online(&self, name: &str) {
        let mut runners = self.runners.lock().unwrap();
        runners.retain(|runner| runner.name != name);
        runners.push(RegisteredRunner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            name: name.to_string(),
            status: "online".into(),
        });
    }

    /// Flip a registered runner's status, e.g. to "offline".
    pub fn set_status(&self, name: &str, status: &str) -> bool {
        match self
            .runners
            .lock()
            .unwrap()
            .iter_mut()
            .find(|runner| runner.name == name)
        {
            Some(runner) => {
                runner.status = status.into();
                true
            }
            None => false,
        }
    }

    pub fn runner_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runners
            .lock()
            .unwrap()
            .iter()
            .map(|runner| runner.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl IdentityClient for MockIdentity {
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError> {
        Ok(RegistrationToken {
            token: format!("mock-{}", monotonic_ns()),
            expires_at: "9999-12-31T23:59:59Z".into(),
        })
    }

    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>, IdentityError> {
        Ok(self.runners.lock().unwrap().clone())
    }

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError> {
        self.runners.lock().unwrap().retain(|runner| runner.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_are_mock_prefixed_and_distinct() {
        let identity = MockIdentity::new();
        let a = identity.issue_registration_token().await.unwrap();
        let b = identity.issue_registration_token().await.unwrap();
        assert!(a.token.starts_with("mock-"));
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn register_then_deregister_round_trips() {
        let identity = MockIdentity::new();
        identity.register_online("r-1");
        identity.register_online("r-2");

        let runners = identity.list_runners().await.unwrap();
        assert_eq!(runners.len(), 2);
        assert!(runners.iter().all(|r| r.status == "online"));

        let id = runners[0].id;
        identity.deregister_runner(id).await.unwrap();
        assert_eq!(identity.list_runners().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn re_registration_replaces_the_stale_record() {
        let identity = MockIdentity::new();
        identity.register_online("r-1");
        identity.set_status("r-1", "offline");
        identity.register_online("r-1");

        let runners = identity.list_runners().await.unwrap();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].status, "online");
    }
}
