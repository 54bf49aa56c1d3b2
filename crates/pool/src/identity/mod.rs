//! Registration credentials and registry bookkeeping for the runner
//! registry, either against the real GitHub API or an in-process mock.

mod github;
mod mock;

pub use github::GithubClient;
pub use mock::MockIdentity;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("user accounts cannot register account-scoped runners; a repository is required")]
    AccountScopeUnsupported,

    #[error("github request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signing app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("system clock is before the unix epoch")]
    Clock,

    #[error("unexpected status {status} from {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: reqwest::StatusCode,
    },
}

/// Where the pool's runners register.
///
/// Account-scoped registration is only available to organizations; a user
/// account must pin a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerScope {
    Organization { org: String },
    Repository { account: String, repo: String },
}

impl RunnerScope {
    pub fn resolve(
        org: Option<&str>,
        user: Option<&str>,
        repo: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let account = org.or(user).unwrap_or_default();
        match repo {
            Some(repo) => Ok(RunnerScope::Repository {
                account: account.into(),
                repo: repo.into(),
            }),
            None if org.is_some() => Ok(RunnerScope::Organization {
                org: account.into(),
            }),
            None => Err(IdentityError::AccountScopeUnsupported),
        }
    }
}

/// A short-lived credential the guest uses to register exactly one runner.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
    pub status: String,
}

#[async_trait::async_trait]
pub trait IdentityClient: Send + Sync {
    /// Issue a registration credential for the configured scope.
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError>;

    /// Every runner currently registered under the scope, all pages.
    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>, IdentityError>;

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_without_repo_is_account_scoped() {
        let scope = RunnerScope::resolve(Some("acme"), None, None).unwrap();
        assert_eq!(
            scope,
            RunnerScope::Organization { org: "acme".into() }
        );
    }

    #[test]
    fn repo_pins_the_scope_for_any_account() {
        let scope = RunnerScope::resolve(None, Some("octocat"), Some("tool")).unwrap();
        assert_eq!(
            scope,
            RunnerScope::Repository {
                account: "octocat".into(),
                repo: "tool".into()
            }
        );
    }

    #[test]
    fn user_without_repo_is_rejected() {
        assert!(matches!(
            RunnerScope::resolve(None, Some("octocat"), None),
            Err(IdentityError::AccountScopeUnsupported)
        ));
    }
}
