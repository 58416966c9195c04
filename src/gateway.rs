/// External collaborator clients
///
/// Thin JSON clients for the services this pipeline consumes: the tweet
/// provider gateway (which owns the vendor wire format), and the platform
/// backend hosting the credit ledger and identity resolution.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::provider::{AuthorInfo, PostDetail, ProviderError, SearchPage, TweetProvider};

/// Downstream credit ledger. Fire-and-forget: a failure leaves the reward
/// record unsent for later reconciliation, there is no rollback.
#[async_trait]
pub trait RewardLedger: Send + Sync {
    /// Returns the ledger transaction id.
    async fn credit_reward(&self, user_id: &str, post_id: &str, amount: u32) -> Result<String>;
}

/// Maps a provider author id to the internal platform user, if linked.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_platform_user(&self, author_id: &str) -> Result<Option<String>>;
}

/// HTTP-backed `TweetProvider` speaking the gateway's neutral JSON contract.
pub struct GatewayClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
    max_batch: usize,
}

impl GatewayClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
            max_batch: 100,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.trim());
        }
        request
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.trim());
        }
        request
    }
}

/// Map an HTTP response onto the provider error taxonomy. Rate-limit
/// responses carry the reset hint so callers can log a useful delay.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse().ok());
            Err(ProviderError::RateLimited { retry_after_secs })
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Unauthorized),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn network(err: reqwest::Error) -> ProviderError {
    ProviderError::Network(err.to_string())
}

fn decode(err: reqwest::Error) -> ProviderError {
    ProviderError::Decode(err.to_string())
}

#[async_trait]
impl TweetProvider for GatewayClient {
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        next_token: Option<&str>,
    ) -> Result<SearchPage, ProviderError> {
        let mut params: Vec<(&str, String)> = vec![
            ("query", query.to_string()),
            ("max_results", max_results.to_string()),
        ];
        if let Some(start) = start {
            params.push(("start_time", start.to_rfc3339()));
        }
        if let Some(end) = end {
            params.push(("end_time", end.to_rfc3339()));
        }
        if let Some(token) = next_token {
            params.push(("next_token", token.to_string()));
        }

        let response = self
            .get("/search")
            .query(&params)
            .send()
            .await
            .map_err(network)?;
        check(response).await?.json().await.map_err(decode)
    }

    async fn post_detail(&self, id: &str) -> Result<PostDetail, ProviderError> {
        let response = self
            .get(&format!("/posts/{}", id))
            .send()
            .await
            .map_err(network)?;
        check(response).await?.json().await.map_err(decode)
    }

    async fn post_detail_lite(&self, id: &str) -> Result<PostDetail, ProviderError> {
        let response = self
            .get(&format!("/posts/{}/lite", id))
            .send()
            .await
            .map_err(network)?;
        check(response).await?.json().await.map_err(decode)
    }

    async fn author(&self, author_id: &str) -> Result<AuthorInfo, ProviderError> {
        let response = self
            .get(&format!("/authors/{}", author_id))
            .send()
            .await
            .map_err(network)?;
        check(response).await?.json().await.map_err(decode)
    }

    async fn batch_post_details(&self, ids: &[String]) -> Result<Vec<PostDetail>, ProviderError> {
        #[derive(Serialize)]
        struct BatchRequest<'a> {
            ids: &'a [String],
        }

        let response = self
            .post("/posts/batch")
            .json(&BatchRequest { ids })
            .send()
            .await
            .map_err(network)?;
        check(response).await?.json().await.map_err(decode)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}

/// Platform backend client: credit ledger plus identity resolution.
pub struct LedgerClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl LedgerClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.trim()),
            None => request,
        }
    }
}

#[derive(Serialize)]
struct CreditRequest<'a> {
    user_id: &'a str,
    post_id: &'a str,
    amount: u32,
}

#[derive(Deserialize)]
struct CreditResponse {
    transaction_id: String,
}

#[derive(Deserialize)]
struct IdentityResponse {
    user_id: String,
}

#[async_trait]
impl RewardLedger for LedgerClient {
    async fn credit_reward(&self, user_id: &str, post_id: &str, amount: u32) -> Result<String> {
        let response = self
            .authorized(self.http.post(format!("{}/credits", self.base_url)))
            .json(&CreditRequest {
                user_id,
                post_id,
                amount,
            })
            .send()
            .await
            .context("Failed to reach the credit ledger")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ledger rejected credit: {} - {}", status, body);
        }

        let credit: CreditResponse = response
            .json()
            .await
            .context("Failed to parse ledger response")?;
        Ok(credit.transaction_id)
    }
}

#[async_trait]
impl IdentityResolver for LedgerClient {
    async fn resolve_platform_user(&self, author_id: &str) -> Result<Option<String>> {
        let response = self
            .authorized(
                self.http
                    .get(format!("{}/identities/{}", self.base_url, author_id)),
            )
            .send()
            .await
            .context("Failed to reach the identity service")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Identity lookup failed: {} - {}", status, body);
        }

        let identity: IdentityResponse = response
            .json()
            .await
            .context("Failed to parse identity response")?;
        Ok(Some(identity.user_id))
    }
}
