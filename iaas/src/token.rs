//! Process-global API credential that reissues itself when stale.
//!
//! All workers read the token through one shared holder. Refresh is guarded
//! by a mutex; concurrent readers may observe a token that is mid-refresh,
//! which is acceptable because the API signals expiry with a 401 that the
//! client retries once after a forced refresh.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use settings::Settings;

/// Tokens older than this are reissued before the next read.
const THRESHOLD_MINUTES: i64 = 40;

#[derive(Debug)]
pub enum TokenError {
    Http(reqwest::Error),
    Rejected { status: u16, body: String },
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Http(err) => write!(f, "token request failed: {err}"),
            TokenError::Rejected { status, body } => {
                write!(f, "token request rejected with HTTP {status}: {body}")
            }
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Http(err) => Some(err),
            TokenError::Rejected { .. } => None,
        }
    }
}

impl From<reqwest::Error> for TokenError {
    fn from(err: reqwest::Error) -> Self {
        TokenError::Http(err)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

struct Issued {
    token: String,
    created: DateTime<Utc>,
}

/// Returns true when a token issued at `created` must be reissued at `now`.
pub fn is_stale(created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created > Duration::minutes(THRESHOLD_MINUTES)
}

pub struct TokenHolder {
    http: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    api_key: String,
    inner: Mutex<Option<Issued>>,
}

impl TokenHolder {
    pub fn new(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            auth_url: format!("{}auth/login/", settings.api_url),
            username: settings.api_username.clone(),
            password: settings.api_password.clone(),
            api_key: settings.api_key.clone(),
            inner: Mutex::new(None),
        }
    }

    /// Retrieve the token, reissuing it first if it is missing or stale.
    pub async fn get(&self) -> Result<String, TokenError> {
        let mut slot = self.inner.lock().await;
        let stale = match slot.as_ref() {
            Some(issued) => is_stale(issued.created, Utc::now()),
            None => true,
        };
        if stale {
            let token = self.issue().await?;
            *slot = Some(Issued { token, created: Utc::now() });
            debug!("generated new token");
        }
        Ok(slot.as_ref().map(|i| i.token.clone()).unwrap_or_default())
    }

    /// Unconditionally reissue, used when the API reports the token expired
    /// before the local threshold elapsed.
    pub async fn refresh(&self) -> Result<String, TokenError> {
        let token = self.issue().await?;
        let mut slot = self.inner.lock().await;
        *slot = Some(Issued { token: token.clone(), created: Utc::now() });
        debug!("refreshed token after expiry signal");
        Ok(token)
    }

    async fn issue(&self) -> Result<String, TokenError> {
        let response = self
            .http
            .post(&self.auth_url)
            .json(&serde_json::json!({
                "email": self.username,
                "password": self.password,
                "api_key": self.api_key,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected { status: status.as_u16(), body });
        }
        let parsed: TokenResponse = response.json().await?;
        Ok(parsed.token)
    }
}
