//! Authenticated access to the IaaS API.
//!
//! Three verbs cover everything the agent does: paginated list, read by id,
//! and partial update. A token-expired 401 is retried exactly once after a
//! forced refresh; every other non-200 is surfaced (or, for lists, logged
//! and folded into a partial result, matching the reconciliation posture
//! that the next poll re-requests anything that mattered).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use settings::Settings;

use crate::resource::RunRobot;
use crate::token::{TokenError, TokenHolder};

/// Service paths under the API root.
pub mod service {
    pub const VIRTUAL_ROUTER: &str = "iaas/virtual_router";
    pub const VM: &str = "iaas/vm";
    pub const SNAPSHOT: &str = "iaas/snapshot";
    pub const BACKUP: &str = "iaas/backup";
    pub const SERVER: &str = "iaas/server";
    pub const IP_ADDRESS: &str = "iaas/ip_address";
    pub const VPN: &str = "iaas/vpn";
    pub const RUN_ROBOT: &str = "iaas/run_robot";
}

#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
    NotFound,
    Decode(serde_json::Error),
    Token(TokenError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(err) => write!(f, "API request failed: {err}"),
            ApiError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            ApiError::NotFound => write!(f, "record not found"),
            ApiError::Decode(err) => write!(f, "could not decode API response: {err}"),
            ApiError::Token(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Http(err) => Some(err),
            ApiError::Decode(err) => Some(err),
            ApiError::Token(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::Token(err)
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// One page of a list response.
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_records: usize,
}

/// Drive a page fetcher until the accumulated records reach the advertised
/// total. A failed first page yields an empty list; a failure mid-way
/// yields the partial result. Neither is retried here; the poll loop will
/// re-request whatever still matters.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Vec<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut page = 0u32;
    let mut records: Vec<T> = Vec::new();
    let total = match fetch(page).await {
        Ok(first) => {
            let total = first.total_records;
            records.extend(first.content);
            total
        }
        Err(err) => {
            error!(error = %err, "list request failed on the first page");
            return records;
        }
    };

    while records.len() < total {
        page += 1;
        match fetch(page).await {
            Ok(next) => {
                if next.content.is_empty() {
                    // A shrinking result set; stop rather than spin.
                    break;
                }
                records.extend(next.content);
            }
            Err(err) => {
                error!(error = %err, page, "list request failed mid-pagination, returning partial result");
                return records;
            }
        }
    }
    records
}

#[derive(serde::Deserialize)]
struct ListEnvelope<T> {
    content: Vec<T>,
    #[serde(rename = "_metadata")]
    metadata: ListMetadata,
}

#[derive(serde::Deserialize)]
struct ListMetadata {
    total_records: usize,
}

#[derive(serde::Deserialize)]
struct ReadEnvelope<T> {
    content: T,
}

pub struct Client {
    http: reqwest::Client,
    base: String,
    token: Arc<TokenHolder>,
}

impl Client {
    pub fn new(settings: &Settings) -> Self {
        let http = reqwest::Client::new();
        let token = Arc::new(TokenHolder::new(http.clone(), settings));
        Self {
            http,
            base: settings.api_url.clone(),
            token,
        }
    }

    fn url(&self, service: &str) -> String {
        format!("{}{}/", self.base, service)
    }

    fn record_url(&self, service: &str, pk: i64) -> String {
        format!("{}{}/{}/", self.base, service, pk)
    }

    /// Returns true when the response is the API's token-expired signal.
    fn token_expired(status: u16, body: &str) -> bool {
        status == 401
            && serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .is_some_and(|d| d.contains("token is expired"))
    }

    /// Send a GET, retrying once with a refreshed token if the API signals
    /// expiry.
    async fn get_with_retry(&self, url: &str, params: &[(String, String)]) -> Result<(u16, String)> {
        let mut token = self.token.get().await?;
        for attempt in 0..2 {
            let response = self
                .http
                .get(url)
                .header("X-Auth-Token", &token)
                .query(params)
                .send()
                .await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            if attempt == 0 && Self::token_expired(status, &body) {
                token = self.token.refresh().await?;
                continue;
            }
            return Ok((status, body));
        }
        unreachable!("loop always returns by the second attempt")
    }

    async fn patch_with_retry(&self, url: &str, data: &Value) -> Result<(u16, String)> {
        let mut token = self.token.get().await?;
        for attempt in 0..2 {
            let response = self
                .http
                .patch(url)
                .header("X-Auth-Token", &token)
                .json(data)
                .send()
                .await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            if attempt == 0 && Self::token_expired(status, &body) {
                token = self.token.refresh().await?;
                continue;
            }
            return Ok((status, body));
        }
        unreachable!("loop always returns by the second attempt")
    }

    /// Fetch every record matching `params`, following pagination.
    pub async fn list<T: DeserializeOwned>(
        &self,
        service: &str,
        params: &[(&str, String)],
    ) -> Vec<T> {
        let url = self.url(service);
        debug!(service, "listing records");
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        collect_pages(|page| {
            let url = url.clone();
            let mut params = params.clone();
            params.push(("page".to_string(), page.to_string()));
            async move {
                let (status, body) = self.get_with_retry(&url, &params).await?;
                if status != 200 {
                    return Err(ApiError::Status { status, body });
                }
                let envelope: ListEnvelope<T> = serde_json::from_str(&body)?;
                Ok(Page {
                    content: envelope.content,
                    total_records: envelope.metadata.total_records,
                })
            }
        })
        .await
    }

    /// Read one record by id. A 404 is [`ApiError::NotFound`] so scrub
    /// workers can treat already-deleted targets as a clean no-op.
    pub async fn read<T: DeserializeOwned>(&self, service: &str, pk: i64) -> Result<T> {
        let url = self.record_url(service, pk);
        debug!(service, pk, "reading record");
        let (status, body) = self.get_with_retry(&url, &[]).await?;
        match status {
            200 => {
                let envelope: ReadEnvelope<T> = serde_json::from_str(&body)?;
                Ok(envelope.content)
            }
            404 => Err(ApiError::NotFound),
            _ => Err(ApiError::Status { status, body }),
        }
    }

    /// Partial update carrying only the supplied fields.
    pub async fn partial_update(&self, service: &str, pk: i64, data: &Value) -> Result<()> {
        let url = self.record_url(service, pk);
        debug!(service, pk, %data, "partial update");
        let (status, body) = self.patch_with_retry(&url, data).await?;
        if status == 200 {
            Ok(())
        } else {
            Err(ApiError::Status { status, body })
        }
    }

    /// Update only the state field.
    pub async fn set_state(&self, service: &str, pk: i64, state: crate::State) -> Result<()> {
        self.partial_update(service, pk, &serde_json::json!({ "state": state.code() }))
            .await
    }

    /// Poll for pending work. `None` means the region has nothing for us.
    pub async fn run_robot(&self) -> Result<Option<RunRobot>> {
        let url = self.url(service::RUN_ROBOT);
        let (status, body) = self.get_with_retry(&url, &[]).await?;
        if status != 200 {
            return Err(ApiError::Status { status, body });
        }
        let envelope: ReadEnvelope<RunRobot> = serde_json::from_str(&body)?;
        if envelope.content.project_ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(envelope.content))
    }

    /// Acknowledge a dispatched batch so the API stops re-offering it.
    pub async fn ack_run_robot(&self, project_ids: &[i64]) -> Result<()> {
        let url = self.url(service::RUN_ROBOT);
        let token = self.token.get().await?;
        let response = self
            .http
            .post(&url)
            .header("X-Auth-Token", &token)
            .json(&serde_json::json!({ "project_ids": project_ids }))
            .send()
            .await?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            if Self::token_expired(status, &body) {
                let token = self.token.refresh().await?;
                let retry = self
                    .http
                    .post(&url)
                    .header("X-Auth-Token", &token)
                    .json(&serde_json::json!({ "project_ids": project_ids }))
                    .send()
                    .await?;
                if retry.status().as_u16() == 200 {
                    return Ok(());
                }
                let status = retry.status().as_u16();
                let body = retry.text().await.unwrap_or_default();
                return Err(ApiError::Status { status, body });
            }
            Err(ApiError::Status { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn page_ok(content: Vec<i64>, total: usize) -> Result<Page<i64>> {
        Ok(Page { content, total_records: total })
    }

    #[tokio::test]
    async fn pagination_stops_at_total_records() {
        let calls = RefCell::new(0u32);
        let records = collect_pages(|page| {
            *calls.borrow_mut() += 1;
            async move {
                match page {
                    0 => page_ok(vec![1, 2], 5),
                    1 => page_ok(vec![3, 4], 5),
                    2 => page_ok(vec![5], 5),
                    _ => panic!("fetched past the advertised total"),
                }
            }
        })
        .await;
        assert_eq!(records, vec![1, 2, 3, 4, 5]);
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn single_page_needs_one_request() {
        let records = collect_pages(|page| async move {
            assert_eq!(page, 0);
            page_ok(vec![7], 1)
        })
        .await;
        assert_eq!(records, vec![7]);
    }

    #[tokio::test]
    async fn mid_pagination_error_returns_partial() {
        let records = collect_pages(|page| async move {
            match page {
                0 => page_ok(vec![1, 2], 4),
                _ => Err(ApiError::Status { status: 500, body: String::new() }),
            }
        })
        .await;
        assert_eq!(records, vec![1, 2]);
    }

    #[tokio::test]
    async fn first_page_error_returns_empty() {
        let records: Vec<i64> = collect_pages(|_| async {
            Err(ApiError::Status { status: 500, body: String::new() })
        })
        .await;
        assert!(records.is_empty());
    }

    #[test]
    fn token_expired_detection() {
        assert!(Client::token_expired(
            401,
            r#"{"detail": "JWT token is expired. Please login again."}"#
        ));
        assert!(!Client::token_expired(401, r#"{"detail": "bad credentials"}"#));
        assert!(!Client::token_expired(403, r#"{"detail": "token is expired"}"#));
        assert!(!Client::token_expired(401, "not json"));
    }
}
