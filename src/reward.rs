/// Reward engine
///
/// Computes per-author credits on a fixed multi-trigger daily cadence:
/// flat "regular" credits for recent posts from stored snapshots, and tiered
/// "bonus" credits from live metrics refreshed in paced batches with a
/// retry-then-fallback-to-snapshot policy. Dispatches finished rewards to
/// the credit ledger.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time;

use crate::config::{Config, SharedConfig};
use crate::error::MentionRewardsError;
use crate::gateway::{IdentityResolver, RewardLedger};
use crate::ingest::IngestScheduler;
use crate::provider::{PostKind, ProviderError, TweetProvider};
use crate::store::{save_state, PostRecord, RewardRecord, RewardTier, StateStore};

/// Calculation-history entries kept in the checkpoint.
const CALC_HISTORY_KEEP: usize = 30;

/// Posts refreshed per author during the bonus pass.
const REFRESH_POSTS_PER_AUTHOR: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardState {
    pub running: bool,
    pub last_calculation: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub rewards: BTreeMap<NaiveDate, Vec<RewardRecord>>,
    pub history: Vec<CalculationHistoryEntry>,
    pub last_error: Option<String>,
    pub total_authors_rewarded: u64,
    pub total_credits_distributed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationHistoryEntry {
    pub date: NaiveDate,
    pub ran_at: DateTime<Utc>,
    pub success: bool,
    pub authors_rewarded: u32,
    pub credits_distributed: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalculationOutcome {
    pub date: NaiveDate,
    pub posts_considered: usize,
    pub eligible_posts: usize,
    pub authors_rewarded: usize,
    pub credits_distributed: u64,
    pub skipped_already_rewarded: usize,
    pub degraded_refreshes: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardStatus {
    pub campaign: String,
    pub running: bool,
    pub armed: bool,
    pub last_calculation: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_authors_rewarded: u64,
    pub total_credits_distributed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyRewardStatistics {
    pub date: NaiveDate,
    pub authors_rewarded: usize,
    pub credits_distributed: u64,
    pub regular_credits: u64,
    pub bonus_credits: u64,
    pub with_share_link: usize,
    pub average_credits: f64,
    pub unsent: usize,
}

/// Freshest metrics obtainable for one author within the retry budget.
struct LiveMetrics {
    follower_count: u64,
    /// post id -> (view count, share-link flag)
    posts: HashMap<String, (u64, bool)>,
    degraded: bool,
}

pub struct RewardEngine {
    campaign: String,
    config: SharedConfig,
    provider: Arc<dyn TweetProvider>,
    ledger: Arc<dyn RewardLedger>,
    identity: Arc<dyn IdentityResolver>,
    ingest: Arc<IngestScheduler>,
    store: Arc<dyn StateStore>,
    state: Mutex<RewardState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl RewardEngine {
    pub async fn load(
        campaign: &str,
        config: SharedConfig,
        provider: Arc<dyn TweetProvider>,
        ledger: Arc<dyn RewardLedger>,
        identity: Arc<dyn IdentityResolver>,
        ingest: Arc<IngestScheduler>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        let key = format!("reward:{}", campaign);
        let state = crate::store::load_state::<RewardState>(store.as_ref(), &key)
            .await?
            .unwrap_or_default();

        let engine = Arc::new(Self {
            campaign: campaign.to_string(),
            config,
            provider,
            ledger,
            identity,
            ingest,
            store,
            state: Mutex::new(state),
            shutdown: Mutex::new(None),
        });

        engine.reconcile().await;
        Ok(engine)
    }

    fn state_key(&self) -> String {
        format!("reward:{}", self.campaign)
    }

    /// Begin the daily cadence. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_armed().await && self.state.lock().await.running {
            log::info!("Reward engine for {} is already running", self.campaign);
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            state.running = true;
        }
        self.checkpoint().await?;
        self.arm(None).await;

        let hours = self.config.read().await.reward_trigger_hours.clone();
        log::info!(
            "Reward engine started for {}, firing at UTC hours {:?}",
            self.campaign,
            hours
        );
        Ok(())
    }

    /// Cancel future triggers. An in-flight calculation is not interrupted.
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
            log::info!("Reward engine stopped for {}", self.campaign);
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

    async fn reconcile(self: &Arc<Self>) {
        let (running, next_due) = {
            let state = self.state.lock().await;
            (state.running, state.next_due)
        };
        let armed = self.is_armed().await;

        if running && !armed {
            let err = MentionRewardsError::StateInconsistency(format!(
                "reward engine for {} marked running but no timer armed",
                self.campaign
            ));
            log::warn!("{}; re-arming", err);
            let missed = next_due
                .filter(|due| *due <= Utc::now())
                .map(|due| due.date_naive());
            self.arm(missed).await;
        } else if !running && armed {
            let err = MentionRewardsError::StateInconsistency(format!(
                "reward engine for {} has an armed timer but is marked stopped",
                self.campaign
            ));
            log::warn!("{}; disarming", err);
            self.disarm().await;
        }
    }

    async fn arm(self: &Arc<Self>, catch_up: Option<NaiveDate>) {
        let (tx, mut rx) = watch::channel(true);
        *self.shutdown.lock().await = Some(tx);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(date) = catch_up {
                log::warn!("Running missed reward calculation for {}", date);
                engine.run_scheduled(date).await;
            }

            loop {
                let hours = engine.config.read().await.reward_trigger_hours.clone();
                let next = next_trigger(Utc::now(), &hours);
                {
                    let mut state = engine.state.lock().await;
                    state.next_due = Some(next);
                }
                if let Err(err) = engine.checkpoint().await {
                    log::error!("Failed to checkpoint next trigger time: {:#}", err);
                }

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = time::sleep(wait) => {}
                    _ = rx.changed() => break,
                }
                engine.run_scheduled(next.date_naive()).await;
            }
            log::debug!("Reward loop for {} exited", engine.campaign);
        });
    }

    async fn disarm(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(false);
        }
    }

    async fn run_scheduled(&self, date: NaiveDate) {
        log::info!("Scheduled reward calculation triggered for {}", date);
        match self.calculate(date).await {
            Ok(outcome) => {
                let mut state = self.state.lock().await;
                state.last_error = None;
                log::info!(
                    "Scheduled calculation for {} done: {} authors, {} credits",
                    date,
                    outcome.authors_rewarded,
                    outcome.credits_distributed
                );
            }
            Err(err) => {
                log::error!("Scheduled reward calculation failed for {}: {:#}", date, err);
                {
                    let mut state = self.state.lock().await;
                    state.last_error = Some(format!("{:#}", err));
                    state.history.push(CalculationHistoryEntry {
                        date,
                        ran_at: Utc::now(),
                        success: false,
                        authors_rewarded: 0,
                        credits_distributed: 0,
                        duration_ms: 0,
                        error: Some(format!("{:#}", err)),
                    });
                    trim_history(&mut state.history);
                }
                // Best effort; the next trigger retries anyway.
                let _ = self.checkpoint().await;
            }
        }
    }

    /// Compute and dispatch rewards for one UTC day. Idempotent: an author
    /// already rewarded for `date` is never rewarded again, and existing
    /// unsent records are only re-dispatched, never recomputed.
    pub async fn calculate(&self, date: NaiveDate) -> Result<CalculationOutcome> {
        let cfg = self.config.read().await.clone();
        let started = Utc::now();

        let (bonus_window, regular_window) = reward_windows(&cfg, date);
        log::info!(
            "Calculating rewards for {}: bonus window {} to {}, regular window {} to {}",
            date,
            bonus_window.0,
            bonus_window.1,
            regular_window.0,
            regular_window.1
        );

        let bonus_posts = self.ingest.query_by_range(bonus_window.0, bonus_window.1).await;
        let regular_posts = self
            .ingest
            .query_by_range(regular_window.0, regular_window.1)
            .await;
        let posts_considered = bonus_posts.len() + regular_posts.len();

        let bonus_eligible = filter_eligible(&cfg, bonus_posts);
        let regular_eligible = filter_eligible(&cfg, regular_posts);
        let eligible_posts = bonus_eligible.len() + regular_eligible.len();

        // Idempotency pre-check against persisted records.
        let already: HashSet<String> = {
            let state = self.state.lock().await;
            state
                .rewards
                .get(&date)
                .map(|records| records.iter().map(|r| r.author_id.clone()).collect())
                .unwrap_or_default()
        };
        let skipped_already_rewarded = bonus_eligible
            .iter()
            .chain(regular_eligible.iter())
            .filter(|p| already.contains(&p.author_id))
            .count();

        let regular_by_author = group_by_author(regular_eligible, &already);
        let bonus_by_author = group_by_author(bonus_eligible, &already);

        let mut records: BTreeMap<String, RewardRecord> = BTreeMap::new();
        let mut processed_ids: Vec<String> = Vec::new();

        // Regular credits: flat rate per post, capped, stored snapshots only.
        for (author, posts) in &regular_by_author {
            let counted = posts.len().min(cfg.regular_max_posts);
            let credits = counted as u32 * cfg.regular_credit_per_post;
            let reference = &posts[0];

            records.insert(
                author.clone(),
                RewardRecord {
                    author_id: author.clone(),
                    author_handle: reference.author_handle.clone(),
                    reward_date: date,
                    post_id: reference.id.clone(),
                    post_count: posts.len() as u32,
                    regular_credits: credits,
                    bonus_credits: 0,
                    bonus_before_multiplier: 0,
                    final_credits: credits,
                    has_share_link: reference.has_share_link,
                    sent: false,
                    sent_at: None,
                    transaction_id: None,
                },
            );
            processed_ids.extend(posts.iter().take(counted).map(|p| p.id.clone()));

            log::debug!(
                "Regular credits for @{}: {} ({} posts)",
                reference.author_handle,
                credits,
                posts.len()
            );
        }

        // Bonus credits: tiered on the freshest metrics obtainable.
        let live = self.refresh_live_metrics(&cfg, &bonus_by_author).await;
        let degraded_refreshes = live.values().filter(|m| m.degraded).count();

        for (author, posts) in &bonus_by_author {
            let metrics = live.get(author);
            let mut bonus = 0u32;
            let mut before_multiplier = 0u32;
            let mut credited: Vec<String> = Vec::new();
            let mut best: Option<(&PostRecord, u64, bool)> = None;

            for post in posts {
                let (views, has_link) = metrics
                    .and_then(|m| m.posts.get(&post.id).copied())
                    .unwrap_or((post.view_count, post.has_share_link));
                let followers = metrics
                    .map(|m| m.follower_count)
                    .unwrap_or(post.follower_count);

                if views < cfg.min_views_for_bonus {
                    continue;
                }
                let Some(tier) = best_tier(&cfg.reward_tiers, views, followers) else {
                    continue;
                };

                before_multiplier += tier.credits;
                let mut credits = tier.credits;
                if has_link {
                    credits = (credits as f64 * cfg.share_link_multiplier).floor() as u32;
                }
                bonus += credits;
                credited.push(post.id.clone());

                if best.as_ref().map_or(true, |(_, v, _)| views > *v) {
                    best = Some((post, views, has_link));
                }
            }

            let Some((reference, _, reference_link)) = best else {
                continue;
            };
            let bonus = bonus.min(cfg.daily_bonus_cap);

            match records.entry(author.clone()) {
                Entry::Occupied(mut slot) => {
                    let record = slot.get_mut();
                    record.bonus_credits = bonus;
                    record.bonus_before_multiplier = before_multiplier;
                    record.final_credits = record.regular_credits + bonus;
                    record.post_count += posts.len() as u32;
                    record.has_share_link = record.has_share_link || reference_link;
                }
                Entry::Vacant(slot) => {
                    slot.insert(RewardRecord {
                        author_id: author.clone(),
                        author_handle: reference.author_handle.clone(),
                        reward_date: date,
                        post_id: reference.id.clone(),
                        post_count: posts.len() as u32,
                        regular_credits: 0,
                        bonus_credits: bonus,
                        bonus_before_multiplier: before_multiplier,
                        final_credits: bonus,
                        has_share_link: reference_link,
                        sent: false,
                        sent_at: None,
                        transaction_id: None,
                    });
                }
            }
            processed_ids.extend(credited);

            log::debug!(
                "Bonus credits for @{}: {} (before multiplier {})",
                reference.author_handle,
                bonus,
                before_multiplier
            );
        }

        let new_records: Vec<RewardRecord> = records.into_values().collect();
        let authors_rewarded = new_records.len();
        let credits_distributed: u64 = new_records.iter().map(|r| r.final_credits as u64).sum();

        // Merge with the persisted records for this date, then dispatch every
        // unsent record (including leftovers from earlier runs).
        let mut day_records = {
            let mut state = self.state.lock().await;
            let entry = state.rewards.entry(date).or_default();
            entry.extend(new_records);
            entry.clone()
        };
        self.dispatch(&mut day_records).await;

        {
            let mut state = self.state.lock().await;
            state.rewards.insert(date, day_records);

            // Retention relative to the calculation date.
            let cutoff = date - Duration::days(cfg.reward_retention_days);
            let expired: Vec<NaiveDate> = state
                .rewards
                .keys()
                .filter(|d| **d < cutoff)
                .cloned()
                .collect();
            for day in &expired {
                state.rewards.remove(day);
            }
            if !expired.is_empty() {
                log::info!("Dropped reward records for {} expired dates", expired.len());
            }

            state.total_authors_rewarded += authors_rewarded as u64;
            state.total_credits_distributed += credits_distributed;
            state.last_calculation = Some(Utc::now());
            state.history.push(CalculationHistoryEntry {
                date,
                ran_at: started,
                success: true,
                authors_rewarded: authors_rewarded as u32,
                credits_distributed,
                duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64,
                error: None,
            });
            trim_history(&mut state.history);
        }
        self.checkpoint().await?;

        // Flip processed only for posts actually included in a reward.
        if !processed_ids.is_empty() {
            self.ingest.mark_processed(&processed_ids).await?;
        }

        let outcome = CalculationOutcome {
            date,
            posts_considered,
            eligible_posts,
            authors_rewarded,
            credits_distributed,
            skipped_already_rewarded,
            degraded_refreshes,
            duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64,
        };

        log::info!(
            "Reward calculation for {} completed: {} authors rewarded, {} credits, {} posts skipped as already rewarded",
            date,
            outcome.authors_rewarded,
            outcome.credits_distributed,
            outcome.skipped_already_rewarded
        );
        Ok(outcome)
    }

    /// Refresh follower and view counts in author batches. A failed author is
    /// retried once after a full backoff, then falls back to the stored
    /// snapshot; nobody is dropped for refresh failure.
    async fn refresh_live_metrics(
        &self,
        cfg: &Config,
        authors: &BTreeMap<String, Vec<PostRecord>>,
    ) -> HashMap<String, LiveMetrics> {
        let mut live = HashMap::new();
        if authors.is_empty() {
            return live;
        }

        let ids: Vec<&String> = authors.keys().collect();
        let batch_size = cfg.refresh_batch_size.max(1);
        let batch_count = (ids.len() + batch_size - 1) / batch_size;
        let mut failed: Vec<&String> = Vec::new();

        for (index, batch) in ids.chunks(batch_size).enumerate() {
            log::debug!(
                "Refreshing live metrics, batch {}/{} ({} authors)",
                index + 1,
                batch_count,
                batch.len()
            );
            for &author in batch {
                match self.refresh_author(cfg, author, &authors[author]).await {
                    Ok(metrics) => {
                        live.insert(author.clone(), metrics);
                    }
                    Err(err) => {
                        log::warn!("Live refresh failed for author {}: {}", author, err);
                        failed.push(author);
                    }
                }
            }
            // Mandatory pause between batches for the provider's rate budget.
            if index + 1 < batch_count {
                time::sleep(StdDuration::from_millis(cfg.inter_batch_delay_ms)).await;
            }
        }

        if !failed.is_empty() {
            log::warn!(
                "{} author refreshes failed, retrying once after {}s backoff",
                failed.len(),
                cfg.retry_backoff_secs
            );
            time::sleep(StdDuration::from_secs(cfg.retry_backoff_secs)).await;

            for author in failed {
                match self.refresh_author(cfg, author, &authors[author]).await {
                    Ok(metrics) => {
                        live.insert(author.clone(), metrics);
                    }
                    Err(err) => {
                        log::warn!(
                            "Refresh retry failed for author {} ({}), falling back to stored snapshot",
                            author,
                            err
                        );
                        live.insert(author.clone(), snapshot_metrics(&authors[author]));
                    }
                }
            }
        }

        live
    }

    async fn refresh_author(
        &self,
        cfg: &Config,
        author: &str,
        posts: &[PostRecord],
    ) -> Result<LiveMetrics, ProviderError> {
        let info = self.provider.author(author).await?;

        if cfg.api_call_delay_ms > 0 {
            time::sleep(StdDuration::from_millis(cfg.api_call_delay_ms)).await;
        }

        let limit = REFRESH_POSTS_PER_AUTHOR.min(self.provider.max_batch_size());
        let ids: Vec<String> = posts.iter().take(limit).map(|p| p.id.clone()).collect();
        let details = self.provider.batch_post_details(&ids).await?;

        Ok(LiveMetrics {
            follower_count: info.follower_count,
            posts: details
                .into_iter()
                .map(|d| (d.post_id, (d.view_count, d.has_share_link)))
                .collect(),
            degraded: false,
        })
    }

    /// Send unsent records to the ledger. A per-author failure leaves that
    /// record unsent without aborting the batch; an author without a linked
    /// platform identity is silently left for later reconciliation.
    async fn dispatch(&self, records: &mut [RewardRecord]) {
        for record in records.iter_mut().filter(|r| !r.sent) {
            let user = match self.identity.resolve_platform_user(&record.author_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    log::debug!(
                        "Author {} has no linked platform identity, leaving reward unsent",
                        record.author_id
                    );
                    continue;
                }
                Err(err) => {
                    log::warn!(
                        "Identity lookup failed for {}: {:#}",
                        record.author_id,
                        err
                    );
                    continue;
                }
            };

            match self
                .ledger
                .credit_reward(&user, &record.post_id, record.final_credits)
                .await
            {
                Ok(transaction_id) => {
                    record.sent = true;
                    record.sent_at = Some(Utc::now());
                    record.transaction_id = Some(transaction_id);
                    log::info!(
                        "Credited {} credits to {} (@{})",
                        record.final_credits,
                        user,
                        record.author_handle
                    );
                }
                Err(err) => {
                    let err = MentionRewardsError::Dispatch {
                        author: record.author_id.clone(),
                        reason: format!("{:#}", err),
                    };
                    log::error!("{}", err);
                }
            }
        }
    }

    pub async fn status(&self) -> RewardStatus {
        let armed = self.is_armed().await;
        let state = self.state.lock().await;
        RewardStatus {
            campaign: self.campaign.clone(),
            running: state.running,
            armed,
            last_calculation: state.last_calculation,
            next_due: state.next_due,
            last_error: state.last_error.clone(),
            total_authors_rewarded: state.total_authors_rewarded,
            total_credits_distributed: state.total_credits_distributed,
        }
    }

    pub async fn history(&self, days: i64) -> Vec<CalculationHistoryEntry> {
        let cutoff = Utc::now() - Duration::days(days);
        let state = self.state.lock().await;
        let mut history: Vec<CalculationHistoryEntry> = state
            .history
            .iter()
            .filter(|h| h.ran_at >= cutoff)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.ran_at.cmp(&a.ran_at));
        history
    }

    pub async fn records_for_author(&self, author_id: &str, days: i64) -> Vec<RewardRecord> {
        let cutoff = Utc::now().date_naive() - Duration::days(days);
        let state = self.state.lock().await;
        let mut records: Vec<RewardRecord> = state
            .rewards
            .iter()
            .filter(|(date, _)| **date >= cutoff)
            .flat_map(|(_, records)| records.iter())
            .filter(|r| r.author_id == author_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.reward_date.cmp(&a.reward_date));
        records
    }

    pub async fn records_for_date(&self, date: NaiveDate) -> Vec<RewardRecord> {
        let state = self.state.lock().await;
        state.rewards.get(&date).cloned().unwrap_or_default()
    }

    pub async fn has_records_for_date(&self, date: NaiveDate) -> bool {
        let state = self.state.lock().await;
        state.rewards.get(&date).map_or(false, |r| !r.is_empty())
    }

    pub async fn has_been_rewarded(&self, author_id: &str, date: NaiveDate) -> bool {
        let state = self.state.lock().await;
        state
            .rewards
            .get(&date)
            .map_or(false, |records| records.iter().any(|r| r.author_id == author_id))
    }

    pub async fn daily_statistics(&self, date: NaiveDate) -> DailyRewardStatistics {
        let records = self.records_for_date(date).await;
        let credits: u64 = records.iter().map(|r| r.final_credits as u64).sum();
        DailyRewardStatistics {
            date,
            authors_rewarded: records.len(),
            credits_distributed: credits,
            regular_credits: records.iter().map(|r| r.regular_credits as u64).sum(),
            bonus_credits: records.iter().map(|r| r.bonus_credits as u64).sum(),
            with_share_link: records.iter().filter(|r| r.has_share_link).count(),
            average_credits: if records.is_empty() {
                0.0
            } else {
                credits as f64 / records.len() as f64
            },
            unsent: records.iter().filter(|r| !r.sent).count(),
        }
    }

    /// Operator repair hook: drop all reward records for one date.
    pub async fn clear_rewards_for_date(&self, date: NaiveDate) -> Result<usize> {
        let removed = {
            let mut state = self.state.lock().await;
            state.rewards.remove(&date).map(|r| r.len()).unwrap_or(0)
        };
        if removed > 0 {
            log::info!("Cleared {} reward records for {}", removed, date);
            self.checkpoint().await?;
        }
        Ok(removed)
    }

    async fn checkpoint(&self) -> Result<()> {
        let snapshot = self.state.lock().await.clone();
        save_state(self.store.as_ref(), &self.state_key(), &snapshot).await
    }
}

/// Bonus and regular query windows for a target date, both half-open.
fn reward_windows(
    cfg: &Config,
    date: NaiveDate,
) -> ((DateTime<Utc>, DateTime<Utc>), (DateTime<Utc>, DateTime<Utc>)) {
    let midnight = date.and_time(NaiveTime::MIN).and_utc();
    let bonus_start = midnight - Duration::hours(cfg.bonus_offset_hours);
    let bonus_end = bonus_start + Duration::hours(cfg.bonus_window_hours);
    let regular_start = midnight - Duration::hours(24);
    ((bonus_start, bonus_end), (regular_start, midnight))
}

fn filter_eligible(cfg: &Config, posts: Vec<PostRecord>) -> Vec<PostRecord> {
    posts
        .into_iter()
        .filter(|p| {
            p.kind == PostKind::Original
                && !cfg.excluded_author_ids.contains(&p.author_id)
                && !p.processed
        })
        .collect()
}

fn group_by_author(
    posts: Vec<PostRecord>,
    already_rewarded: &HashSet<String>,
) -> BTreeMap<String, Vec<PostRecord>> {
    let mut by_author: BTreeMap<String, Vec<PostRecord>> = BTreeMap::new();
    for post in posts {
        if already_rewarded.contains(&post.author_id) {
            continue;
        }
        by_author.entry(post.author_id.clone()).or_default().push(post);
    }
    by_author
}

/// Best match: the highest credits among tiers whose thresholds are all met.
fn best_tier(tiers: &[RewardTier], views: u64, followers: u64) -> Option<&RewardTier> {
    tiers
        .iter()
        .filter(|t| views >= t.min_views && followers >= t.min_followers)
        .max_by_key(|t| t.credits)
}

fn snapshot_metrics(posts: &[PostRecord]) -> LiveMetrics {
    LiveMetrics {
        follower_count: posts.iter().map(|p| p.follower_count).max().unwrap_or(0),
        posts: posts
            .iter()
            .map(|p| (p.id.clone(), (p.view_count, p.has_share_link)))
            .collect(),
        degraded: true,
    }
}

/// First configured UTC hour strictly after `after`.
fn next_trigger(after: DateTime<Utc>, hours: &[u32]) -> DateTime<Utc> {
    let mut hours: Vec<u32> = hours.iter().copied().filter(|h| *h < 24).collect();
    if hours.is_empty() {
        hours.push(0);
    }
    hours.sort_unstable();
    hours.dedup();

    let midnight = after.date_naive().and_time(NaiveTime::MIN).and_utc();
    for hour in &hours {
        let candidate = midnight + Duration::hours(*hour as i64);
        if candidate > after {
            return candidate;
        }
    }
    midnight + Duration::days(1) + Duration::hours(hours[0] as i64)
}

fn trim_history(history: &mut Vec<CalculationHistoryEntry>) {
    if history.len() > CALC_HISTORY_KEEP {
        let excess = history.len() - CALC_HISTORY_KEEP;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MemoryStateStore, MockLedger, MockProvider, ScriptedPost};
    use chrono::TimeZone;

    struct Harness {
        ingest: Arc<IngestScheduler>,
        engine: Arc<RewardEngine>,
        provider: Arc<MockProvider>,
        ledger: Arc<MockLedger>,
    }

    async fn harness(cfg: Config, posts: Vec<ScriptedPost>) -> Harness {
        let provider = Arc::new(MockProvider::with_posts(posts));
        let store = Arc::new(MemoryStateStore::default());
        let ledger = Arc::new(MockLedger::default());
        let shared = cfg.shared();

        let ingest = IngestScheduler::load(
            "campaign-1",
            shared.clone(),
            provider.clone(),
            store.clone(),
        )
        .await
        .unwrap();

        let engine = RewardEngine::load(
            "campaign-1",
            shared,
            provider.clone(),
            ledger.clone(),
            ledger.clone(),
            ingest.clone(),
            store,
        )
        .await
        .unwrap();

        Harness {
            ingest,
            engine,
            provider,
            ledger,
        }
    }

    fn target_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn bonus_time() -> DateTime<Utc> {
        // Inside [D-48h, D-24h) for the default windows.
        Utc.with_ymd_and_hms(2026, 3, 8, 6, 0, 0).unwrap()
    }

    fn regular_time() -> DateTime<Utc> {
        // Inside [D-24h, D).
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    async fn ingest_all(harness: &Harness) {
        let start = Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        harness.ingest.fetch_range(start, end).await.unwrap();
    }

    #[test]
    fn best_tier_picks_highest_satisfied_credits() {
        let tiers = vec![
            RewardTier { min_views: 100, min_followers: 50, credits: 10 },
            RewardTier { min_views: 1000, min_followers: 500, credits: 50 },
        ];
        assert_eq!(best_tier(&tiers, 1500, 600).map(|t| t.credits), Some(50));
        assert_eq!(best_tier(&tiers, 200, 10), None);
    }

    #[test]
    fn default_windows_do_not_overlap() {
        let cfg = test_config();
        let (bonus, regular) = reward_windows(&cfg, target_date());
        assert!(bonus.0 < bonus.1);
        assert!(bonus.1 <= regular.0);
        assert_eq!(regular.1, target_date().and_time(NaiveTime::MIN).and_utc());
    }

    #[test]
    fn next_trigger_walks_configured_hours() {
        let hours = vec![0, 8, 16];
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(
            next_trigger(at, &hours),
            Utc.with_ymd_and_hms(2026, 3, 10, 16, 0, 0).unwrap()
        );

        let late = Utc.with_ymd_and_hms(2026, 3, 10, 20, 0, 0).unwrap();
        assert_eq!(
            next_trigger(late, &hours),
            Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn share_link_multiplier_floors_bonus() {
        let mut cfg = test_config();
        cfg.share_link_multiplier = 1.5;
        cfg.reward_tiers = vec![RewardTier { min_views: 100, min_followers: 50, credits: 10 }];

        let h = harness(
            cfg,
            vec![
                ScriptedPost::original("with-link", "a1", bonus_time())
                    .views(150)
                    .followers(60)
                    .share_link(),
                ScriptedPost::original("no-link", "a2", bonus_time())
                    .views(150)
                    .followers(60),
            ],
        )
        .await;
        ingest_all(&h).await;

        h.engine.calculate(target_date()).await.unwrap();

        let records = h.engine.records_for_date(target_date()).await;
        let linked = records.iter().find(|r| r.author_id == "a1").unwrap();
        let plain = records.iter().find(|r| r.author_id == "a2").unwrap();
        assert_eq!(linked.bonus_credits, 15);
        assert_eq!(linked.bonus_before_multiplier, 10);
        assert_eq!(plain.bonus_credits, 10);
    }

    #[tokio::test]
    async fn regular_credits_cap_at_configured_posts() {
        let mut cfg = test_config();
        // Quota must not interfere with the reward-side cap here.
        cfg.max_posts_per_author_per_day = 20;

        let posts = (0..12i64)
            .map(|i| {
                ScriptedPost::original(
                    &format!("r{}", i),
                    "a1",
                    regular_time() + Duration::minutes(i),
                )
            })
            .collect();
        let h = harness(cfg, posts).await;
        ingest_all(&h).await;

        let outcome = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(outcome.authors_rewarded, 1);

        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records[0].regular_credits, 20);
        assert_eq!(records[0].final_credits, 20);
        assert_eq!(records[0].post_count, 12);
    }

    #[tokio::test]
    async fn merged_record_combines_regular_and_bonus() {
        let h = harness(
            test_config(),
            vec![
                ScriptedPost::original("recent", "a1", regular_time()),
                ScriptedPost::original("earlier", "a1", bonus_time())
                    .views(150)
                    .followers(60),
            ],
        )
        .await;
        ingest_all(&h).await;

        h.engine.calculate(target_date()).await.unwrap();

        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].regular_credits, 2);
        assert_eq!(records[0].bonus_credits, 15);
        assert_eq!(records[0].final_credits, 17);
    }

    #[tokio::test]
    async fn second_calculation_rewards_nobody_twice() {
        let h = harness(
            test_config(),
            vec![
                ScriptedPost::original("recent", "a1", regular_time()),
                ScriptedPost::original("earlier", "a2", bonus_time())
                    .views(150)
                    .followers(60),
            ],
        )
        .await;
        ingest_all(&h).await;

        let first = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(first.authors_rewarded, 2);
        let credited_after_first = h.ledger.credited.lock().unwrap().len();

        let second = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(second.authors_rewarded, 0);

        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(h.ledger.credited.lock().unwrap().len(), credited_after_first);
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_snapshot() {
        let h = harness(
            test_config(),
            vec![ScriptedPost::original("p1", "a1", bonus_time())
                .views(150)
                .followers(60)],
        )
        .await;
        ingest_all(&h).await;

        // Both the initial attempt and the retry fail.
        h.provider.fail_author("a1", 10);

        let outcome = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(outcome.degraded_refreshes, 1);
        assert_eq!(outcome.authors_rewarded, 1);

        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records[0].bonus_credits, 15);
    }

    #[tokio::test]
    async fn live_metrics_override_stored_snapshot() {
        // Stored snapshot is below the bonus threshold.
        let h = harness(
            test_config(),
            vec![ScriptedPost::original("p1", "a1", bonus_time())
                .views(5)
                .followers(60)],
        )
        .await;
        ingest_all(&h).await;

        // Views grew after ingestion.
        h.provider.set_views("p1", 150);

        h.engine.calculate(target_date()).await.unwrap();
        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bonus_credits, 15);
    }

    #[tokio::test]
    async fn low_view_posts_earn_no_bonus() {
        let h = harness(
            test_config(),
            vec![ScriptedPost::original("p1", "a1", bonus_time())
                .views(5)
                .followers(60)],
        )
        .await;
        ingest_all(&h).await;

        let outcome = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(outcome.authors_rewarded, 0);
        assert!(h.engine.records_for_date(target_date()).await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_record_unsent_and_retries_later() {
        let h = harness(
            test_config(),
            vec![ScriptedPost::original("p1", "a1", regular_time())],
        )
        .await;
        ingest_all(&h).await;

        h.ledger.failing_users.lock().unwrap().insert("user-a1".into());
        h.engine.calculate(target_date()).await.unwrap();

        let records = h.engine.records_for_date(target_date()).await;
        assert!(!records[0].sent);
        assert!(records[0].transaction_id.is_none());

        // The ledger recovers; the next run re-dispatches without recomputing.
        h.ledger.failing_users.lock().unwrap().clear();
        let second = h.engine.calculate(target_date()).await.unwrap();
        assert_eq!(second.authors_rewarded, 0);

        let records = h.engine.records_for_date(target_date()).await;
        assert!(records[0].sent);
        assert_eq!(records[0].final_credits, 2);
        assert_eq!(h.ledger.credited_total(), 2);
    }

    #[tokio::test]
    async fn unlinked_author_is_skipped_silently() {
        let h = harness(
            test_config(),
            vec![ScriptedPost::original("p1", "a1", regular_time())],
        )
        .await;
        ingest_all(&h).await;

        h.ledger.unlinked_authors.lock().unwrap().insert("a1".into());
        h.engine.calculate(target_date()).await.unwrap();

        let records = h.engine.records_for_date(target_date()).await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].sent);
        assert!(h.ledger.credited.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn old_reward_dates_are_dropped_by_retention() {
        let old_date = target_date() - Duration::days(10);
        let old_post_time = old_date.and_time(NaiveTime::MIN).and_utc() - Duration::hours(30);

        let h = harness(
            test_config(),
            vec![
                ScriptedPost::original("old", "a1", old_post_time)
                    .views(150)
                    .followers(60),
                ScriptedPost::original("recent", "a2", regular_time()),
            ],
        )
        .await;
        let start = old_post_time - Duration::hours(1);
        let end = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        h.ingest.fetch_range(start, end).await.unwrap();

        h.engine.calculate(old_date).await.unwrap();
        assert!(h.engine.has_records_for_date(old_date).await);

        h.engine.calculate(target_date()).await.unwrap();
        assert!(!h.engine.has_records_for_date(old_date).await);
        assert!(h.engine.has_records_for_date(target_date()).await);
    }

    #[tokio::test]
    async fn accessors_reflect_persisted_rewards() {
        let h = harness(
            test_config(),
            vec![
                ScriptedPost::original("recent", "a1", regular_time()),
                ScriptedPost::original("earlier", "a2", bonus_time())
                    .views(150)
                    .followers(60)
                    .share_link(),
            ],
        )
        .await;
        ingest_all(&h).await;

        h.engine.calculate(target_date()).await.unwrap();

        assert!(h.engine.has_been_rewarded("a1", target_date()).await);
        assert!(!h.engine.has_been_rewarded("a99", target_date()).await);

        let stats = h.engine.daily_statistics(target_date()).await;
        assert_eq!(stats.authors_rewarded, 2);
        assert_eq!(stats.regular_credits, 2);
        // Tier 15 with a share link: floor(15 * 1.1) = 16.
        assert_eq!(stats.bonus_credits, 16);
        assert_eq!(stats.credits_distributed, 18);
        assert_eq!(stats.with_share_link, 1);
        assert_eq!(stats.unsent, 0);

        let history = h.engine.history(1).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);

        assert_eq!(
            h.engine.clear_rewards_for_date(target_date()).await.unwrap(),
            2
        );
        assert!(!h.engine.has_records_for_date(target_date()).await);
    }

    #[tokio::test]
    async fn included_posts_are_marked_processed() {
        let h = harness(
            test_config(),
            vec![
                ScriptedPost::original("credited", "a1", bonus_time())
                    .views(150)
                    .followers(60),
                ScriptedPost::original("too-few-views", "a2", bonus_time()).views(5),
            ],
        )
        .await;
        ingest_all(&h).await;

        h.engine.calculate(target_date()).await.unwrap();

        let (bonus, _) = reward_windows(&test_config(), target_date());
        let posts = h.ingest.query_by_range(bonus.0, bonus.1).await;
        let credited = posts.iter().find(|p| p.id == "credited").unwrap();
        let skipped = posts.iter().find(|p| p.id == "too-few-views").unwrap();
        assert!(credited.processed);
        assert!(!skipped.processed);
    }
}
