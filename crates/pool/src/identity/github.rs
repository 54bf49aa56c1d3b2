//! GitHub App client: JWT bearer, exchanged for an installation access
//! token, then the self-hosted runner endpoints under the configured scope.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;

use super::{IdentityClient, IdentityError, RegisteredRunner, RegistrationToken, RunnerScope};

const API_ROOT: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Installation tokens live for an hour; refresh comfortably before that.
const TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

const PAGE_SIZE: usize = 100;

struct CachedToken {
    token: String,
    refresh_after: Instant,
}

pub struct GithubClient {
    http: reqwest::Client,
    app_id: u64,
    signing_key: EncodingKey,
    scope: RunnerScope,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

#[derive(serde::Serialize)]
struct Claims {
    iat: u64,
    exp: u64,
    iss: String,
}

#[derive(serde::Deserialize)]
struct Installation {
    id: u64,
}

#[derive(serde::Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(serde::Deserialize)]
struct RunnerPage {
    runners: Vec<RegisteredRunner>,
}

impl GithubClient {
    pub fn new(
        app_id: u64,
        private_key_pem: &[u8],
        scope: RunnerScope,
    ) -> Result<Self, IdentityError> {
        let signing_key = EncodingKey::from_rsa_pem(private_key_pem)?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("runner-pool/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            app_id,
            signing_key,
            scope,
            cached: tokio::sync::Mutex::new(None),
        })
    }

    /// Short-lived JWT authenticating us as the app itself.
    fn app_jwt(&self) -> Result<String, IdentityError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| IdentityError::Clock)?
            .as_secs();
        let claims = Claims {
            // Backdated to absorb clock drift between us and the API.
            iat: now.saturating_sub(60),
            exp: now + 540,
            iss: self.app_id.to_string(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.signing_key,
        )?)
    }

    fn installation_url(&self) -> String {
        match &self.scope {
            RunnerScope::Organization { org } => format!("{API_ROOT}/orgs/{org}/installation"),
            RunnerScope::Repository { account, repo } => {
                format!("{API_ROOT}/repos/{account}/{repo}/installation")
            }
        }
    }

    fn runners_url(&self) -> String {
        match &self.scope {
            RunnerScope::Organization { org } => format!("{API_ROOT}/orgs/{org}/actions/runners"),
            RunnerScope::Repository { account, repo } => {
                format!("{API_ROOT}/repos/{account}/{repo}/actions/runners")
            }
        }
    }

    /// Installation access token for the scope, cached until close to expiry.
    async fn installation_token(&self) -> Result<String, IdentityError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.refresh_after > Instant::now()
        {
            return Ok(token.token.clone());
        }

        let jwt = self.app_jwt()?;
        let response = self
            .http
            .get(self.installation_url())
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(IdentityError::UnexpectedStatus {
                operation: "get installation",
                status: response.status(),
            });
        }
        let installation: Installation = response.json().await?;

        let response = self
            .http
            .post(format!(
                "{API_ROOT}/app/installations/{}/access_tokens",
                installation.id
            ))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(IdentityError::UnexpectedStatus {
                operation: "create installation token",
                status: response.status(),
            });
        }
        let token: InstallationToken = response.json().await?;

        *cached = Some(CachedToken {
            token: token.token.clone(),
            refresh_after: Instant::now() + TOKEN_LIFETIME,
        });
        Ok(token.token)
    }
}

#[async_trait::async_trait]
impl IdentityClient for GithubClient {
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError> {
        let access = self.installation_token().await?;
        let response = self
            .http
            .post(format!("{}/registration-token", self.runners_url()))
            .bearer_auth(&access)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(IdentityError::UnexpectedStatus {
                operation: "issue registration token",
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }

    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>, IdentityError> {
        let access = self.installation_token().await?;
        let mut runners = Vec::new();
        let mut page = 1usize;
        loop {
            let response = self
                .http
                .get(self.runners_url())
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .bearer_auth(&access)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", API_VERSION)
                .send()
                .await?;
            if response.status() != StatusCode::OK {
                return Err(IdentityError::UnexpectedStatus {
                    operation: "list runners",
                    status: response.status(),
                });
            }
            let batch: RunnerPage = response.json().await?;
            let last_page = batch.runners.len() < PAGE_SIZE;
            runners.extend(batch.runners);
            if last_page {
                return Ok(runners);
            }
            page += 1;
        }
    }

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError> {
        let access = self.installation_token().await?;
        let response = self
            .http
            .delete(format!("{}/{id}", self.runners_url()))
            .bearer_auth(&access)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(IdentityError::UnexpectedStatus {
                operation: "deregister runner",
                status: response.status(),
            });
        }
        Ok(())
    }
}
