//! Bearer token lifecycle: challenge-response fetch and self-scheduled renewal.

use std::sync::Arc;
use std::time::Duration;

use common::model::{ChallengeResponse, ChallengeTokenRequest, RefreshTokenRequest, TokenResponse};
use common::prelude::create_hmac_sha256;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::{ApiError, CoordinatorClient};

const CHALLENGE_PATH: &str = "/openbmclapi-agent/challenge";
const TOKEN_PATH: &str = "/openbmclapi-agent/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);
/// Failed renewals retry on the same delay, so it must not be zero.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Api(#[from] ApiError),
}

/// Delay before renewing a token that lives `ttl_ms` milliseconds.
///
/// Ten minutes ahead of expiry, but never earlier than half the lifetime
/// or [`MIN_REFRESH_DELAY`].
pub fn refresh_delay(ttl_ms: u64) -> Duration {
    let ttl = Duration::from_millis(ttl_ms);
    ttl.saturating_sub(REFRESH_MARGIN)
        .max(ttl / 2)
        .max(MIN_REFRESH_DELAY)
}

#[derive(Debug)]
struct TokenState {
    cluster_id: String,
    secret: String,
    client: CoordinatorClient,
    token: RwLock<Option<String>>,
}

impl TokenState {
    async fn fetch(&self) -> Result<TokenResponse, TokenError> {
        let challenge: ChallengeResponse = self
            .client
            .get_json(
                CHALLENGE_PATH,
                &[("clusterId", self.cluster_id.clone())],
                None,
            )
            .await?;
        let request = ChallengeTokenRequest {
            cluster_id: self.cluster_id.clone(),
            signature: create_hmac_sha256(&self.secret, &challenge.challenge),
            challenge: challenge.challenge,
        };
        Ok(self.client.post_json(TOKEN_PATH, &request, None).await?)
    }

    async fn refresh(&self) -> Result<TokenResponse, TokenError> {
        let current = self.token.read().clone().unwrap_or_default();
        let request = RefreshTokenRequest {
            cluster_id: self.cluster_id.clone(),
            token: current,
        };
        Ok(self.client.post_json(TOKEN_PATH, &request, None).await?)
    }

    fn store(&self, token: String) {
        *self.token.write() = Some(token);
    }
}

#[derive(Debug)]
pub struct TokenManager {
    state: Arc<TokenState>,
    fetch_lock: tokio::sync::Mutex<()>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(
        cluster_id: impl Into<String>,
        secret: impl Into<String>,
        client: CoordinatorClient,
    ) -> Self {
        Self {
            state: Arc::new(TokenState {
                cluster_id: cluster_id.into(),
                secret: secret.into(),
                client,
                token: RwLock::new(None),
            }),
            fetch_lock: tokio::sync::Mutex::new(()),
            refresher: Mutex::new(None),
        }
    }

    /// The current token, fetching it on first use.
    ///
    /// Only the first fetch can fail; afterwards the last good token is
    /// returned even if renewals are failing.
    pub async fn get_token(&self) -> Result<String, TokenError> {
        if let Some(token) = self.state.token.read().clone() {
            return Ok(token);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(token) = self.state.token.read().clone() {
            return Ok(token);
        }

        let response = self.state.fetch().await?;
        tracing::info!(ttl_ms = response.ttl, "obtained cluster token");
        self.state.store(response.token.clone());
        self.schedule_refresh(refresh_delay(response.ttl));
        Ok(response.token)
    }

    fn schedule_refresh(&self, first_delay: Duration) {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(delay).await;
                match state.refresh().await {
                    Ok(response) => {
                        tracing::debug!(ttl_ms = response.ttl, "cluster token refreshed");
                        state.store(response.token);
                        delay = refresh_delay(response.ttl);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "token refresh failed, keeping the current token");
                    }
                }
            }
        });

        if let Some(previous) = self.refresher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop renewing. The current token stays readable.
    pub fn close(&self) {
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.close();
    }
}
