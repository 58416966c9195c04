/// Tweet provider interface.
///
/// The pipeline consumes matching posts through this trait; the actual wire
/// client (vendor REST formats, auth, pagination tokens) lives behind an
/// internal gateway and is not implemented here. `gateway.rs` provides the
/// HTTP-backed implementation, `testing.rs` a scripted one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<i64> },

    #[error("unauthorized: gateway rejected the bearer token")]
    Unauthorized,

    #[error("gateway returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed gateway response: {0}")]
    Decode(String),
}

/// Post classification derived from the provider's reference links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostKind {
    Original,
    Reply,
    Repost,
    Quote,
}

/// A search hit. Body text stays on the provider side; only identifiers and
/// the creation timestamp cross this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundPost {
    pub id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

/// Author data expanded alongside search results. The follower count here is
/// the cached snapshot stored with each record; live values come from
/// `author()` at reward time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub follower_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub posts: Vec<FoundPost>,
    pub authors: Vec<AuthorRef>,
    pub next_token: Option<String>,
}

/// Per-post detail. `follower_count` is `None` for the lightweight variant,
/// which skips author resolution entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDetail {
    pub post_id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: PostKind,
    pub view_count: u64,
    pub follower_count: Option<u64>,
    pub has_share_link: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub follower_count: u64,
}

#[async_trait]
pub trait TweetProvider: Send + Sync {
    /// Search posts matching `query` within an optional time window.
    /// Pagination continues with the returned `next_token`.
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        next_token: Option<&str>,
    ) -> Result<SearchPage, ProviderError>;

    /// Full detail for one post, including author follower count.
    async fn post_detail(&self, id: &str) -> Result<PostDetail, ProviderError>;

    /// Lightweight detail: classification, view count and share-link flag
    /// without resolving the author.
    async fn post_detail_lite(&self, id: &str) -> Result<PostDetail, ProviderError>;

    async fn author(&self, author_id: &str) -> Result<AuthorInfo, ProviderError>;

    /// Batched detail lookup, bounded by `max_batch_size`.
    async fn batch_post_details(&self, ids: &[String]) -> Result<Vec<PostDetail>, ProviderError>;

    /// Provider-side cap on one `batch_post_details` call.
    fn max_batch_size(&self) -> usize {
        100
    }
}
