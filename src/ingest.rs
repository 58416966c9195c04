/// Ingestion scheduler
///
/// Handles scheduled fetching of posts matching the campaign handle:
/// cursor-bounded time windows split into paced sub-windows, filtering,
/// deduplication, and the durable post-record set the reward and recovery
/// engines read from.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time;

use crate::config::{Config, SharedConfig};
use crate::error::MentionRewardsError;
use crate::provider::{AuthorRef, FoundPost, PostKind, ProviderError, TweetProvider};
use crate::store::{save_state, FetchHistoryEntry, PostRecord, StateStore};

/// Fetch-history entries kept in the checkpoint.
const FETCH_HISTORY_KEEP: usize = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestState {
    pub running: bool,
    /// End of the last confirmed-successful sub-window. Monotonic.
    pub cursor: Option<DateTime<Utc>>,
    pub posts: HashMap<String, PostRecord>,
    pub fetch_history: Vec<FetchHistoryEntry>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of one fetch cycle or backfill.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: u32,
    pub new: u32,
    pub duplicates: u32,
    pub filtered: u32,
    pub windows: u32,
    pub failed_windows: u32,
    pub new_post_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl FetchReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            fetched: 0,
            new: 0,
            duplicates: 0,
            filtered: 0,
            windows: 0,
            failed_windows: 0,
            new_post_ids: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.failed_windows == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub campaign: String,
    pub running: bool,
    pub armed: bool,
    pub cursor: Option<DateTime<Utc>>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub stored_posts: usize,
    pub fetched_today: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatistics {
    pub total: usize,
    pub originals: usize,
    pub with_share_link: usize,
    pub unprocessed: usize,
    pub by_hour: BTreeMap<String, u32>,
    pub top_authors: Vec<(String, u32)>,
}

/// One owning worker per campaign; obtained through the registry.
pub struct IngestScheduler {
    campaign: String,
    config: SharedConfig,
    provider: Arc<dyn TweetProvider>,
    store: Arc<dyn StateStore>,
    state: Mutex<IngestState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl IngestScheduler {
    /// Load the checkpoint for `campaign` and reconcile the persisted
    /// running flag with the (not yet armed) timer.
    pub async fn load(
        campaign: &str,
        config: SharedConfig,
        provider: Arc<dyn TweetProvider>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        let key = format!("ingest:{}", campaign);
        let state = crate::store::load_state::<IngestState>(store.as_ref(), &key)
            .await?
            .unwrap_or_default();

        let scheduler = Arc::new(Self {
            campaign: campaign.to_string(),
            config,
            provider,
            store,
            state: Mutex::new(state),
            shutdown: Mutex::new(None),
        });

        scheduler.reconcile().await;
        Ok(scheduler)
    }

    fn state_key(&self) -> String {
        format!("ingest:{}", self.campaign)
    }

    pub fn campaign(&self) -> &str {
        &self.campaign
    }

    /// Begin periodic fetching. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_armed().await && self.state.lock().await.running {
            log::info!("Ingestion for {} is already running", self.campaign);
            return Ok(());
        }

        let interval_minutes = self.config.read().await.fetch_interval_minutes;
        {
            let mut state = self.state.lock().await;
            state.running = true;
            state.next_due = Some(Utc::now() + Duration::minutes(interval_minutes));
        }
        self.checkpoint().await?;
        self.arm(false).await;

        log::info!(
            "Ingestion started for {} with interval {} minutes",
            self.campaign,
            interval_minutes
        );
        Ok(())
    }

    /// Cancel future cycles. An in-flight cycle is not interrupted.
    pub async fn stop(&self) -> Result<()> {
        let was_running = {
            let mut state = self.state.lock().await;
            let was = state.running;
            state.running = false;
            state.next_due = None;
            was
        };
        self.disarm().await;
        self.checkpoint().await?;

        if was_running {
            log::info!("Ingestion stopped for {}", self.campaign);
        }
        Ok(())
    }

    pub async fn is_armed(&self) -> bool {
        self.shutdown
            .lock()
            .await
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Re-arm or disarm the timer so it matches the persisted running flag.
    /// Service interruptions can leave the two disagreeing.
    async fn reconcile(self: &Arc<Self>) {
        let (running, next_due) = {
            let state = self.state.lock().await;
            (state.running, state.next_due)
        };
        let armed = self.is_armed().await;

        if running && !armed {
            let err = MentionRewardsError::StateInconsistency(format!(
                "ingestion for {} marked running but no timer armed",
                self.campaign
            ));
            log::warn!("{}; re-arming", err);
            let overdue = next_due.map_or(true, |due| due <= Utc::now());
            self.arm(overdue).await;
        } else if !running && armed {
            let err = MentionRewardsError::StateInconsistency(format!(
                "ingestion for {} has an armed timer but is marked stopped",
                self.campaign
            ));
            log::warn!("{}; disarming", err);
            self.disarm().await;
        }
    }

    async fn arm(self: &Arc<Self>, catch_up: bool) {
        let (tx, mut rx) = watch::channel(true);
        *self.shutdown.lock().await = Some(tx);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let interval_minutes = scheduler.config.read().await.fetch_interval_minutes;
            let mut ticker =
                time::interval(StdDuration::from_secs(interval_minutes.max(1) as u64 * 60));
            if !catch_up {
                // The first tick completes immediately; skip it so the first
                // scheduled cycle runs a full interval from now.
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                scheduler.tick().await;
            }
            log::debug!("Ingestion loop for {} exited", scheduler.campaign);
        });
    }

    async fn disarm(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(false);
        }
    }

    async fn tick(&self) {
        let (interval_minutes, auto_cleanup) = {
            let cfg = self.config.read().await;
            (cfg.fetch_interval_minutes, cfg.auto_cleanup)
        };
        {
            let mut state = self.state.lock().await;
            state.next_due = Some(Utc::now() + Duration::minutes(interval_minutes));
        }

        log::debug!("Scheduled fetch triggered for {}", self.campaign);
        match self.fetch_now().await {
            Ok(report) => {
                log::info!(
                    "Fetch completed for {} - total: {}, new: {}, duplicates: {}, filtered: {}, failed windows: {}",
                    self.campaign,
                    report.fetched,
                    report.new,
                    report.duplicates,
                    report.filtered,
                    report.failed_windows
                );
            }
            Err(err) => {
                log::error!("Scheduled fetch failed for {}: {:#}", self.campaign, err);
                let mut state = self.state.lock().await;
                state.last_error = Some(format!("{:#}", err));
            }
        }

        if auto_cleanup {
            if let Err(err) = self.cleanup_expired().await {
                log::error!("Retention cleanup failed for {}: {:#}", self.campaign, err);
            }
        }
    }

    /// Run one fetch cycle immediately: everything from the cursor up to now.
    pub async fn fetch_now(&self) -> Result<FetchReport> {
        let cfg = self.config.read().await.clone();
        let now = Utc::now();

        let mut start = {
            let state = self.state.lock().await;
            state.cursor.unwrap_or(now - Duration::hours(1))
        };
        // Widen degenerate windows so the provider always sees a meaningful range.
        if now - start < Duration::minutes(cfg.min_window_minutes) {
            start = now - Duration::minutes(cfg.min_window_minutes);
        }

        let report = self.fetch_span(&cfg, start, now, true).await;
        self.finish_cycle(report).await
    }

    /// Backfill a historical range without touching the cursor. Out-of-order
    /// or future-ending ranges are clamped, not rejected.
    pub async fn fetch_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FetchReport> {
        let cfg = self.config.read().await.clone();
        let now = Utc::now();

        let end = end.min(now);
        let start = if start >= end {
            let err = MentionRewardsError::Validation(format!(
                "backfill range starts at or after its end ({} >= {})",
                start, end
            ));
            log::warn!("{}; clamping to the minimum window", err);
            end - Duration::minutes(cfg.min_window_minutes)
        } else {
            start
        };

        log::info!("Backfilling {} from {} to {}", self.campaign, start, end);
        let report = self.fetch_span(&cfg, start, end, false).await;
        self.finish_cycle(report).await
    }

    /// Split `[start, end)` into sub-windows and fetch each sequentially.
    ///
    /// The cursor follows the consecutive successful prefix only: a failed
    /// sub-window stops advancement so its span is re-queried next cycle,
    /// while later windows still fetch (their accepted posts commit).
    async fn fetch_span(
        &self,
        cfg: &Config,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        advance_cursor: bool,
    ) -> FetchReport {
        let mut report = FetchReport::new(Utc::now());
        let sub_window = Duration::minutes(cfg.sub_window_minutes.max(1));

        let mut window_start = start;
        let mut prefix_ok = advance_cursor;

        while window_start < end {
            let window_end = (window_start + sub_window).min(end);
            report.windows += 1;

            match self.fetch_window(cfg, window_start, window_end, &mut report).await {
                Ok(hits) => {
                    if prefix_ok {
                        let mut state = self.state.lock().await;
                        // Empty windows advance too: a confirmed-empty span
                        // is never re-queried.
                        if state.cursor.map_or(true, |cursor| window_end > cursor) {
                            state.cursor = Some(window_end);
                        }
                    }
                    if hits > 0 && window_end < end {
                        time::sleep(StdDuration::from_secs(cfg.pacing_delay_secs)).await;
                    }
                }
                Err(provider_err) => {
                    let err = MentionRewardsError::from(provider_err);
                    log::warn!(
                        "Sub-window {} to {} failed for {}: {}",
                        window_start,
                        window_end,
                        self.campaign,
                        err
                    );
                    report.failed_windows += 1;
                    report
                        .errors
                        .push(format!("{} to {}: {}", window_start, window_end, err));
                    prefix_ok = false;
                    // A failed window always pays the safety delay.
                    time::sleep(StdDuration::from_secs(cfg.pacing_delay_secs)).await;
                }
            }

            window_start = window_end;
        }

        report.finished_at = Utc::now();
        report
    }

    async fn fetch_window(
        &self,
        cfg: &Config,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        report: &mut FetchReport,
    ) -> Result<usize, ProviderError> {
        let mut next_token: Option<String> = None;
        let mut hits = 0usize;

        loop {
            let page = self
                .provider
                .search(
                    &cfg.campaign_handle,
                    cfg.max_posts_per_fetch,
                    Some(start),
                    Some(end),
                    next_token.as_deref(),
                )
                .await?;

            hits += page.posts.len();
            report.fetched += page.posts.len() as u32;

            let authors: HashMap<String, AuthorRef> =
                page.authors.into_iter().map(|a| (a.id.clone(), a)).collect();
            for post in page.posts {
                self.consider_post(cfg, post, &authors, report).await;
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(hits)
    }

    async fn consider_post(
        &self,
        cfg: &Config,
        post: FoundPost,
        authors: &HashMap<String, AuthorRef>,
        report: &mut FetchReport,
    ) {
        {
            let state = self.state.lock().await;
            if state.posts.contains_key(&post.id) {
                report.duplicates += 1;
                return;
            }
        }

        if cfg.excluded_author_ids.contains(&post.author_id) {
            log::debug!(
                "Skipping post {} from excluded author {}",
                post.id,
                post.author_id
            );
            report.filtered += 1;
            return;
        }

        // Lightweight detail: classification, views, share link. No author
        // resolution here; handle and follower snapshot come from the
        // search expansion.
        let detail = match self.provider.post_detail_lite(&post.id).await {
            Ok(detail) => detail,
            Err(provider_err) => {
                let err = MentionRewardsError::from(provider_err);
                log::warn!("Detail fetch failed for post {}: {}", post.id, err);
                report.filtered += 1;
                return;
            }
        };

        if cfg.originals_only && detail.kind != PostKind::Original {
            log::debug!("Skipping non-original post {} ({:?})", post.id, detail.kind);
            report.filtered += 1;
            return;
        }

        let author = authors.get(&post.author_id);
        let record = PostRecord {
            id: post.id.clone(),
            author_id: post.author_id.clone(),
            author_handle: author.map(|a| a.handle.clone()).unwrap_or_default(),
            author_name: author.map(|a| a.display_name.clone()).unwrap_or_default(),
            created_at: detail.created_at,
            kind: detail.kind,
            view_count: detail.view_count,
            follower_count: author.map(|a| a.follower_count).unwrap_or(0),
            has_share_link: detail.has_share_link,
            processed: false,
            fetched_at: Utc::now(),
        };

        let mut state = self.state.lock().await;

        // Per-author acceptance quota for the post's UTC day.
        let day_start = record
            .created_at
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        let day_end = day_start + Duration::days(1);
        let accepted_that_day = state
            .posts
            .values()
            .filter(|p| {
                p.author_id == record.author_id
                    && p.created_at >= day_start
                    && p.created_at < day_end
            })
            .count();
        if accepted_that_day >= cfg.max_posts_per_author_per_day {
            log::debug!(
                "Author {} reached the daily quota of {}, skipping post {}",
                record.author_id,
                cfg.max_posts_per_author_per_day,
                post.id
            );
            report.filtered += 1;
            return;
        }

        match state.posts.entry(post.id.clone()) {
            Entry::Occupied(_) => report.duplicates += 1,
            Entry::Vacant(slot) => {
                slot.insert(record);
                report.new += 1;
                report.new_post_ids.push(post.id);
            }
        }
    }

    /// Append the cycle's history entry and persist durably before returning.
    async fn finish_cycle(&self, report: FetchReport) -> Result<FetchReport> {
        let entry = FetchHistoryEntry {
            fetched_at: report.started_at,
            fetched: report.fetched,
            new: report.new,
            success: report.success(),
            error: if report.errors.is_empty() {
                None
            } else {
                Some(report.errors.join("; "))
            },
            duration_ms: (report.finished_at - report.started_at)
                .num_milliseconds()
                .max(0) as u64,
        };

        {
            let mut state = self.state.lock().await;
            state.fetch_history.push(entry);
            if state.fetch_history.len() > FETCH_HISTORY_KEEP {
                let excess = state.fetch_history.len() - FETCH_HISTORY_KEEP;
                state.fetch_history.drain(..excess);
            }
            state.last_fetch = Some(report.started_at);
            state.last_error = if report.success() {
                None
            } else {
                Some(report.errors.join("; "))
            };
        }

        self.checkpoint().await?;
        Ok(report)
    }

    /// Stored records overlapping `[start, end)`, time-ordered.
    pub async fn query_by_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<PostRecord> {
        let state = self.state.lock().await;
        let mut posts: Vec<PostRecord> = state
            .posts
            .values()
            .filter(|p| p.created_at >= start && p.created_at < end)
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.created_at);
        posts
    }

    /// Flip `processed` on the given records. The reward engine's only write
    /// into the record set.
    pub async fn mark_processed(&self, ids: &[String]) -> Result<usize> {
        let flipped = {
            let mut state = self.state.lock().await;
            let mut flipped = 0;
            for id in ids {
                if let Some(post) = state.posts.get_mut(id) {
                    if !post.processed {
                        post.processed = true;
                        flipped += 1;
                    }
                }
            }
            flipped
        };

        if flipped > 0 {
            self.checkpoint().await?;
        }
        Ok(flipped)
    }

    /// Drop records and history past the retention horizon.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let retention_days = self.config.read().await.retention_days;
        let cutoff = Utc::now() - Duration::days(retention_days);

        let removed = {
            let mut state = self.state.lock().await;
            let before = state.posts.len();
            state.posts.retain(|_, p| p.created_at >= cutoff);
            state.fetch_history.retain(|h| h.fetched_at >= cutoff);
            before - state.posts.len()
        };

        if removed > 0 {
            log::info!("Cleaned up {} expired posts for {}", removed, self.campaign);
            self.checkpoint().await?;
        }
        Ok(removed)
    }

    pub async fn status(&self) -> IngestStatus {
        let armed = self.is_armed().await;
        let state = self.state.lock().await;

        let today_start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let fetched_today = state
            .fetch_history
            .iter()
            .filter(|h| h.success && h.fetched_at >= today_start)
            .map(|h| h.new)
            .sum();

        IngestStatus {
            campaign: self.campaign.clone(),
            running: state.running,
            armed,
            cursor: state.cursor,
            last_fetch: state.last_fetch,
            next_due: state.next_due,
            stored_posts: state.posts.len(),
            fetched_today,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn fetch_history(&self, days: i64) -> Vec<FetchHistoryEntry> {
        let cutoff = Utc::now() - Duration::days(days);
        let state = self.state.lock().await;
        let mut history: Vec<FetchHistoryEntry> = state
            .fetch_history
            .iter()
            .filter(|h| h.fetched_at >= cutoff)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        history
    }

    pub async fn statistics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> IngestStatistics {
        let posts = self.query_by_range(start, end).await;

        let mut by_hour: BTreeMap<String, u32> = BTreeMap::new();
        let mut by_author: HashMap<String, u32> = HashMap::new();
        for post in &posts {
            *by_hour
                .entry(post.created_at.format("%Y-%m-%d %H:00").to_string())
                .or_default() += 1;
            *by_author.entry(post.author_handle.clone()).or_default() += 1;
        }

        let mut top_authors: Vec<(String, u32)> = by_author.into_iter().collect();
        top_authors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_authors.truncate(10);

        IngestStatistics {
            total: posts.len(),
            originals: posts.iter().filter(|p| p.kind == PostKind::Original).count(),
            with_share_link: posts.iter().filter(|p| p.has_share_link).count(),
            unprocessed: posts.iter().filter(|p| !p.processed).count(),
            by_hour,
            top_authors,
        }
    }

    async fn checkpoint(&self) -> Result<()> {
        let snapshot = self.state.lock().await.clone();
        save_state(self.store.as_ref(), &self.state_key(), &snapshot).await
    }

    #[cfg(test)]
    pub(crate) async fn set_cursor(&self, cursor: DateTime<Utc>) {
        self.state.lock().await.cursor = Some(cursor);
    }

    #[cfg(test)]
    pub(crate) async fn cursor(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MemoryStateStore, MockProvider, ScriptedPost};

    async fn scheduler_with(
        provider: Arc<MockProvider>,
        store: Arc<MemoryStateStore>,
        cfg: Config,
    ) -> Arc<IngestScheduler> {
        IngestScheduler::load("campaign-1", cfg.shared(), provider, store)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_ids_never_create_second_record() {
        let now = Utc::now();
        let provider = Arc::new(MockProvider::with_posts(vec![ScriptedPost::original(
            "p1",
            "a1",
            now - Duration::hours(2),
        )]));
        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider, store, test_config()).await;

        let start = now - Duration::hours(3);
        let end = now - Duration::hours(1);

        let first = scheduler.fetch_range(start, end).await.unwrap();
        assert_eq!(first.new, 1);
        assert_eq!(first.duplicates, 0);

        let second = scheduler.fetch_range(start, end).await.unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.duplicates, 1);

        assert_eq!(scheduler.query_by_range(start, end).await.len(), 1);
    }

    #[tokio::test]
    async fn cursor_advances_only_past_successful_windows() {
        let now = Utc::now();
        let origin = now - Duration::minutes(90);

        let provider = Arc::new(MockProvider::with_posts(vec![ScriptedPost::original(
            "p-late",
            "a1",
            now - Duration::minutes(10),
        )]));
        // Second sub-window fails.
        provider.fail_window(origin + Duration::minutes(30), origin + Duration::minutes(60));

        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider, store, test_config()).await;
        scheduler.set_cursor(origin).await;

        let report = scheduler.fetch_now().await.unwrap();
        assert!(report.windows >= 3);
        assert_eq!(report.failed_windows, 1);
        assert!(!report.success());
        // Partial success still commits accepted posts...
        assert_eq!(report.new, 1);
        // ...but the cursor stops at the last good window before the failure.
        assert_eq!(scheduler.cursor().await, Some(origin + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn empty_windows_advance_the_cursor() {
        let now = Utc::now();
        let origin = now - Duration::hours(2);

        let provider = Arc::new(MockProvider::default());
        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider, store, test_config()).await;
        scheduler.set_cursor(origin).await;

        let report = scheduler.fetch_now().await.unwrap();
        assert!(report.success());
        assert_eq!(report.new, 0);

        let cursor = scheduler.cursor().await.unwrap();
        assert!(cursor > origin + Duration::minutes(119));
    }

    #[tokio::test]
    async fn degenerate_window_is_widened() {
        let now = Utc::now();
        let provider = Arc::new(MockProvider::default());
        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider.clone(), store, test_config()).await;
        scheduler.set_cursor(now - Duration::seconds(10)).await;

        scheduler.fetch_now().await.unwrap();

        let log = provider.search_log.lock().unwrap();
        let (start, end) = log[0];
        assert!(end - start >= Duration::seconds(115));
    }

    #[tokio::test]
    async fn filters_non_originals_excluded_authors_and_quota() {
        let now = Utc::now();
        let at = now - Duration::hours(2);

        let mut posts = vec![
            ScriptedPost::original("reply", "a1", at).kind(PostKind::Reply),
            ScriptedPost::original("excluded", "a9", at),
        ];
        for i in 0..12i64 {
            posts.push(ScriptedPost::original(
                &format!("p{}", i),
                "a1",
                at + Duration::minutes(i),
            ));
        }

        let provider = Arc::new(MockProvider::with_posts(posts));
        let store = Arc::new(MemoryStateStore::default());
        let mut cfg = test_config();
        cfg.excluded_author_ids = vec!["a9".into()];
        let scheduler = scheduler_with(provider, store, cfg).await;

        let report = scheduler
            .fetch_range(now - Duration::hours(3), now - Duration::hours(1))
            .await
            .unwrap();

        // 10 accepted for a1; the reply, the excluded author and 2 over-quota
        // posts are filtered.
        assert_eq!(report.new, 10);
        assert_eq!(report.filtered, 4);
    }

    #[tokio::test]
    async fn retention_cleanup_drops_old_records() {
        let now = Utc::now();
        let provider = Arc::new(MockProvider::with_posts(vec![
            ScriptedPost::original("old", "a1", now - Duration::days(6)),
            ScriptedPost::original("fresh", "a2", now - Duration::hours(2)),
        ]));
        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider, store, test_config()).await;

        scheduler
            .fetch_range(now - Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!(
            scheduler.query_by_range(now - Duration::days(7), now).await.len(),
            2
        );

        let removed = scheduler.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);

        let remaining = scheduler.query_by_range(now - Duration::days(7), now).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "fresh");
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let now = Utc::now();
        let provider = Arc::new(MockProvider::with_posts(vec![ScriptedPost::original(
            "p1",
            "a1",
            now - Duration::minutes(30),
        )]));
        let store = Arc::new(MemoryStateStore::default());
        let cfg = test_config();

        let scheduler =
            scheduler_with(provider.clone(), store.clone(), cfg.clone()).await;
        scheduler.set_cursor(now - Duration::hours(1)).await;
        scheduler.fetch_now().await.unwrap();
        let cursor = scheduler.cursor().await;

        let reloaded = scheduler_with(provider, store, cfg).await;
        assert_eq!(reloaded.cursor().await, cursor);
        assert_eq!(
            reloaded.query_by_range(now - Duration::hours(1), now).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn mark_processed_flips_once() {
        let now = Utc::now();
        let provider = Arc::new(MockProvider::with_posts(vec![ScriptedPost::original(
            "p1",
            "a1",
            now - Duration::hours(2),
        )]));
        let store = Arc::new(MemoryStateStore::default());
        let scheduler = scheduler_with(provider, store, test_config()).await;

        scheduler
            .fetch_range(now - Duration::hours(3), now - Duration::hours(1))
            .await
            .unwrap();

        let ids = vec!["p1".to_string(), "missing".to_string()];
        assert_eq!(scheduler.mark_processed(&ids).await.unwrap(), 1);
        assert_eq!(scheduler.mark_processed(&ids).await.unwrap(), 0);

        let posts = scheduler
            .query_by_range(now - Duration::hours(3), now)
            .await;
        assert!(posts[0].processed);
    }
}
