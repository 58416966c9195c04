/// Test support: scripted provider, in-memory checkpoint store, and a
/// recording ledger. Shared by the unit tests and `tests/pipeline.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{default_reward_tiers, Config};
use crate::gateway::{IdentityResolver, RewardLedger};
use crate::provider::{
    AuthorInfo, AuthorRef, FoundPost, PostDetail, PostKind, ProviderError, SearchPage,
    TweetProvider,
};
use crate::store::StateStore;

/// One post the mock provider knows about. `view_count`, `follower_count`
/// and `has_share_link` are the provider-side "live" values; tests mutate
/// them after ingestion to simulate metrics moving.
#[derive(Debug, Clone)]
pub struct ScriptedPost {
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: PostKind,
    pub view_count: u64,
    pub follower_count: u64,
    pub has_share_link: bool,
}

impl ScriptedPost {
    pub fn original(id: &str, author_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            author_id: author_id.to_string(),
            author_handle: format!("handle_{}", author_id),
            author_name: format!("Author {}", author_id),
            created_at,
            kind: PostKind::Original,
            view_count: 0,
            follower_count: 0,
            has_share_link: false,
        }
    }

    pub fn kind(mut self, kind: PostKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn views(mut self, views: u64) -> Self {
        self.view_count = views;
        self
    }

    pub fn followers(mut self, followers: u64) -> Self {
        self.follower_count = followers;
        self
    }

    pub fn share_link(mut self) -> Self {
        self.has_share_link = true;
        self
    }
}

#[derive(Default)]
pub struct MockProvider {
    pub posts: Mutex<Vec<ScriptedPost>>,
    /// Search calls whose window intersects one of these ranges fail.
    pub failing_windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    /// Authors whose `author()` lookup fails, with remaining failure count.
    pub failing_authors: Mutex<HashMap<String, u32>>,
    /// Every search window queried, in call order.
    pub search_log: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl MockProvider {
    pub fn with_posts(posts: Vec<ScriptedPost>) -> Self {
        Self {
            posts: Mutex::new(posts),
            ..Default::default()
        }
    }

    pub fn add_post(&self, post: ScriptedPost) {
        self.posts.lock().unwrap().push(post);
    }

    pub fn fail_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.failing_windows.lock().unwrap().push((start, end));
    }

    /// Make the next `times` author lookups for `author_id` fail.
    pub fn fail_author(&self, author_id: &str, times: u32) {
        self.failing_authors
            .lock()
            .unwrap()
            .insert(author_id.to_string(), times);
    }

    pub fn set_views(&self, post_id: &str, views: u64) {
        for post in self.posts.lock().unwrap().iter_mut() {
            if post.id == post_id {
                post.view_count = views;
            }
        }
    }

    pub fn set_followers(&self, author_id: &str, followers: u64) {
        for post in self.posts.lock().unwrap().iter_mut() {
            if post.author_id == author_id {
                post.follower_count = followers;
            }
        }
    }

    fn detail(&self, post: &ScriptedPost, with_author: bool) -> PostDetail {
        PostDetail {
            post_id: post.id.clone(),
            author_id: post.author_id.clone(),
            created_at: post.created_at,
            kind: post.kind,
            view_count: post.view_count,
            follower_count: with_author.then_some(post.follower_count),
            has_share_link: post.has_share_link,
        }
    }
}

#[async_trait]
impl TweetProvider for MockProvider {
    async fn search(
        &self,
        _query: &str,
        _max_results: u32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        _next_token: Option<&str>,
    ) -> Result<SearchPage, ProviderError> {
        let start = start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = end.unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.search_log.lock().unwrap().push((start, end));

        for (fail_start, fail_end) in self.failing_windows.lock().unwrap().iter() {
            if start < *fail_end && end > *fail_start {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: Some(60),
                });
            }
        }

        let posts = self.posts.lock().unwrap();
        let hits: Vec<&ScriptedPost> = posts
            .iter()
            .filter(|p| p.created_at >= start && p.created_at < end)
            .collect();

        let mut seen = HashSet::new();
        let authors = hits
            .iter()
            .filter(|p| seen.insert(p.author_id.clone()))
            .map(|p| AuthorRef {
                id: p.author_id.clone(),
                handle: p.author_handle.clone(),
                display_name: p.author_name.clone(),
                follower_count: p.follower_count,
            })
            .collect();

        Ok(SearchPage {
            posts: hits
                .iter()
                .map(|p| FoundPost {
                    id: p.id.clone(),
                    author_id: p.author_id.clone(),
                    created_at: p.created_at,
                })
                .collect(),
            authors,
            next_token: None,
        })
    }

    async fn post_detail(&self, id: &str) -> Result<PostDetail, ProviderError> {
        let posts = self.posts.lock().unwrap();
        posts
            .iter()
            .find(|p| p.id == id)
            .map(|p| self.detail(p, true))
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                body: format!("unknown post {}", id),
            })
    }

    async fn post_detail_lite(&self, id: &str) -> Result<PostDetail, ProviderError> {
        let posts = self.posts.lock().unwrap();
        posts
            .iter()
            .find(|p| p.id == id)
            .map(|p| self.detail(p, false))
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                body: format!("unknown post {}", id),
            })
    }

    async fn author(&self, author_id: &str) -> Result<AuthorInfo, ProviderError> {
        {
            let mut failing = self.failing_authors.lock().unwrap();
            if let Some(remaining) = failing.get_mut(author_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Network("connection reset".into()));
                }
            }
        }

        let posts = self.posts.lock().unwrap();
        posts
            .iter()
            .find(|p| p.author_id == author_id)
            .map(|p| AuthorInfo {
                id: p.author_id.clone(),
                handle: p.author_handle.clone(),
                display_name: p.author_name.clone(),
                follower_count: p.follower_count,
            })
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                body: format!("unknown author {}", author_id),
            })
    }

    async fn batch_post_details(&self, ids: &[String]) -> Result<Vec<PostDetail>, ProviderError> {
        let posts = self.posts.lock().unwrap();
        Ok(posts
            .iter()
            .filter(|p| ids.contains(&p.id))
            .map(|p| self.detail(p, false))
            .collect())
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, serde_json::Value>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.states.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &str, state: serde_json::Value) -> Result<()> {
        self.states.lock().unwrap().insert(key.to_string(), state);
        Ok(())
    }
}

/// Ledger double: records every credit call, resolves identities as
/// `user-<author_id>` unless listed as unlinked.
#[derive(Default)]
pub struct MockLedger {
    pub credited: Mutex<Vec<(String, String, u32)>>,
    pub unlinked_authors: Mutex<HashSet<String>>,
    pub failing_users: Mutex<HashSet<String>>,
}

impl MockLedger {
    pub fn credited_total(&self) -> u32 {
        self.credited.lock().unwrap().iter().map(|c| c.2).sum()
    }
}

#[async_trait]
impl RewardLedger for MockLedger {
    async fn credit_reward(&self, user_id: &str, post_id: &str, amount: u32) -> Result<String> {
        if self.failing_users.lock().unwrap().contains(user_id) {
            anyhow::bail!("ledger rejected credit for {}", user_id);
        }
        let mut credited = self.credited.lock().unwrap();
        credited.push((user_id.to_string(), post_id.to_string(), amount));
        Ok(format!("tx-{}", credited.len()))
    }
}

#[async_trait]
impl IdentityResolver for MockLedger {
    async fn resolve_platform_user(&self, author_id: &str) -> Result<Option<String>> {
        if self.unlinked_authors.lock().unwrap().contains(author_id) {
            return Ok(None);
        }
        Ok(Some(format!("user-{}", author_id)))
    }
}

/// A config with all delays zeroed, suitable for tests.
pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/unused".into(),
        campaign_handle: "@campaign".into(),
        provider_base_url: "http://localhost:9000".into(),
        provider_token: None,
        ledger_base_url: "http://localhost:9001".into(),
        ledger_token: None,
        admin_token: None,
        http_port: 8080,
        fetch_interval_minutes: 20,
        max_posts_per_fetch: 100,
        sub_window_minutes: 30,
        min_window_minutes: 2,
        pacing_delay_secs: 0,
        originals_only: true,
        auto_cleanup: false,
        retention_days: 5,
        max_posts_per_author_per_day: 10,
        excluded_author_ids: Vec::new(),
        reward_trigger_hours: vec![0, 8, 16],
        bonus_offset_hours: 48,
        bonus_window_hours: 24,
        regular_credit_per_post: 2,
        regular_max_posts: 10,
        share_link_multiplier: 1.1,
        daily_bonus_cap: 500,
        min_views_for_bonus: 20,
        refresh_batch_size: 50,
        inter_batch_delay_ms: 0,
        api_call_delay_ms: 0,
        retry_backoff_secs: 0,
        reward_retention_days: 5,
        reward_tiers: default_reward_tiers(),
        slice_minutes: 30,
        coalesce_gap_minutes: 60,
        outage_lookback_days: 7,
    }
}
