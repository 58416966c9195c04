/// Recovery engine
///
/// Detects gaps left by downtime and re-drives the pipeline over them:
/// slices an inspection range, flags slices with no stored posts, coalesces
/// contiguous misses into outage windows, then replays ingestion and reward
/// computation. Also produces integrity reports for audit.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::SharedConfig;
use crate::error::MentionRewardsError;
use crate::ingest::IngestScheduler;
use crate::provider::PostKind;
use crate::reward::RewardEngine;
use crate::store::{MissingKind, MissingPeriod};

/// Recovery runs kept for audit.
const RUN_HISTORY_KEEP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryOutcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStep {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    pub detail: String,
    pub error: Option<String>,
}

impl RecoveryStep {
    fn begin(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            started_at: now,
            finished_at: now,
            ok: false,
            detail: String::new(),
            error: None,
        }
    }

    fn finish_ok(&mut self, detail: String) {
        self.ok = true;
        self.detail = detail;
        self.finished_at = Utc::now();
    }

    fn finish_err(&mut self, error: String) {
        self.ok = false;
        self.error = Some(error);
        self.finished_at = Utc::now();
    }
}

/// One bounded synchronous recovery sequence: ingestion replay, then reward
/// recomputation, each independently caught.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub periods: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    pub outcome: RecoveryOutcome,
    pub steps: Vec<RecoveryStep>,
    pub recovered_posts: u32,
    pub recomputed_days: u32,
    pub credits_recomputed: u64,
    pub failed_periods: Vec<String>,
    pub error: Option<String>,
}

impl RecoveryRun {
    fn begin(periods: Vec<(DateTime<Utc>, DateTime<Utc>)>) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            periods,
            outcome: RecoveryOutcome::Failed,
            steps: Vec::new(),
            recovered_posts: 0,
            recomputed_days: 0,
            credits_recomputed: 0,
            failed_periods: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl OutageWindow {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutageSummary {
    pub detected: bool,
    pub checked_from: DateTime<Utc>,
    pub checked_to: DateTime<Utc>,
    pub missing_slices: usize,
    pub windows: Vec<OutageWindow>,
    pub longest: Option<OutageWindow>,
    pub plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityFinding {
    pub period: MissingPeriod,
    pub severity: Severity,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub generated_at: DateTime<Utc>,
    pub checked_from: DateTime<Utc>,
    pub checked_to: DateTime<Utc>,
    pub complete: bool,
    pub expected_slices: usize,
    pub valid_slices: usize,
    pub missing_slices: usize,
    pub findings: Vec<IntegrityFinding>,
    pub recommendations: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryHealth {
    pub healthy: bool,
    pub total_runs: usize,
    pub recent_failures: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

pub struct RecoveryEngine {
    campaign: String,
    config: SharedConfig,
    ingest: Arc<IngestScheduler>,
    rewards: Arc<RewardEngine>,
    history: Mutex<Vec<RecoveryRun>>,
}

impl RecoveryEngine {
    pub fn new(
        campaign: &str,
        config: SharedConfig,
        ingest: Arc<IngestScheduler>,
        rewards: Arc<RewardEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            campaign: campaign.to_string(),
            config,
            ingest,
            rewards,
            history: Mutex::new(Vec::new()),
        })
    }

    /// Probe fixed-size slices of `[start, end)`; a slice with no stored
    /// records is missing. Out-of-order ranges are clamped, not rejected.
    pub async fn detect_missing_periods(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MissingPeriod> {
        let slice_minutes = self.config.read().await.slice_minutes.max(1);
        let (start, end) = clamp_range(start, end, slice_minutes);
        let slice = Duration::minutes(slice_minutes);

        let mut missing = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let slice_end = (cursor + slice).min(end);
            let posts = self.ingest.query_by_range(cursor, slice_end).await;
            if posts.is_empty() {
                missing.push(MissingPeriod {
                    start: cursor,
                    end: slice_end,
                    kind: MissingKind::PostData,
                });
            }
            cursor = slice_end;
        }

        log::info!(
            "Gap detection for {}: {} missing slice(s) between {} and {}",
            self.campaign,
            missing.len(),
            start,
            end
        );
        missing
    }

    /// Consolidated outage summary over the last `check_days` days.
    pub async fn detect_outage(&self, check_days: i64) -> OutageSummary {
        let end = Utc::now();
        let start = end - Duration::days(check_days.max(1));

        let missing = self.detect_missing_periods(start, end).await;
        let gap_minutes = self.config.read().await.coalesce_gap_minutes;
        let windows = coalesce_outages(&missing, gap_minutes);
        let longest = windows
            .iter()
            .max_by_key(|w| w.duration_minutes())
            .cloned();

        OutageSummary {
            detected: !missing.is_empty(),
            checked_from: start,
            checked_to: end,
            missing_slices: missing.len(),
            plan: build_plan(&missing, &windows),
            windows,
            longest,
        }
    }

    /// Replay the pipeline over one period: refetch posts, then recompute
    /// rewards for every UTC day the period touches. With `force` false,
    /// days that already have reward records are skipped.
    pub async fn recover_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        force: bool,
    ) -> RecoveryRun {
        log::info!(
            "Recovering {} from {} to {} (force: {})",
            self.campaign,
            start,
            end,
            force
        );
        let mut run = RecoveryRun::begin(vec![(start, end)]);

        // Ingestion replay.
        let mut step = RecoveryStep::begin("refetch-posts");
        match self.ingest.fetch_range(start, end).await {
            Ok(report) if report.success() => {
                run.recovered_posts = report.new;
                step.finish_ok(format!(
                    "recovered {} posts across {} windows",
                    report.new, report.windows
                ));
            }
            Ok(report) => {
                run.recovered_posts = report.new;
                step.finish_err(format!(
                    "{} of {} windows failed: {}",
                    report.failed_windows,
                    report.windows,
                    report.errors.join("; ")
                ));
            }
            Err(err) => step.finish_err(format!("{:#}", err)),
        }
        run.steps.push(step);

        // Reward recomputation, per touched UTC day.
        let mut step = RecoveryStep::begin("recompute-rewards");
        let mut errors: Vec<String> = Vec::new();
        let mut recomputed = 0u32;
        let mut skipped = 0u32;
        let mut credits = 0u64;

        let last_day = (end - Duration::seconds(1)).date_naive();
        let mut day = start.date_naive();
        while day <= last_day {
            if !force && self.rewards.has_records_for_date(day).await {
                skipped += 1;
            } else {
                match self.rewards.calculate(day).await {
                    Ok(outcome) => {
                        recomputed += 1;
                        credits += outcome.credits_distributed;
                    }
                    Err(err) => errors.push(format!("{}: {:#}", day, err)),
                }
            }
            day = day + Duration::days(1);
        }

        run.recomputed_days = recomputed;
        run.credits_recomputed = credits;
        if errors.is_empty() {
            step.finish_ok(format!(
                "recomputed {} day(s), skipped {}, {} credits",
                recomputed, skipped, credits
            ));
        } else {
            step.finish_err(errors.join("; "));
        }
        run.steps.push(step);

        run.outcome = outcome_from_steps(&run.steps);
        if run.outcome != RecoveryOutcome::Success {
            run.failed_periods.push(period_id(start, end));
            run.error = Some(
                run.steps
                    .iter()
                    .filter_map(|s| s.error.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        run.finished_at = Utc::now();

        log::info!(
            "Recovery of {} finished: {:?}, {} posts, {} day(s) recomputed",
            period_id(start, end),
            run.outcome,
            run.recovered_posts,
            run.recomputed_days
        );
        self.record_run(run.clone()).await;
        run
    }

    /// Recover several periods; a failure in one never aborts the others.
    pub async fn recover_multiple(
        &self,
        periods: &[(DateTime<Utc>, DateTime<Utc>)],
        force: bool,
    ) -> RecoveryRun {
        log::info!(
            "Recovering {} period(s) for {}",
            periods.len(),
            self.campaign
        );
        let mut overall = RecoveryRun::begin(periods.to_vec());
        let mut succeeded = 0usize;

        for (start, end) in periods {
            let run = self.recover_period(*start, *end, force).await;
            overall.recovered_posts += run.recovered_posts;
            overall.recomputed_days += run.recomputed_days;
            overall.credits_recomputed += run.credits_recomputed;
            overall.steps.extend(run.steps);
            overall.failed_periods.extend(run.failed_periods);
            if run.outcome == RecoveryOutcome::Success {
                succeeded += 1;
            }
        }

        overall.outcome = if succeeded == periods.len() {
            RecoveryOutcome::Success
        } else if succeeded > 0 {
            RecoveryOutcome::Partial
        } else {
            RecoveryOutcome::Failed
        };
        if !overall.failed_periods.is_empty() {
            overall.error = Some(format!(
                "{} of {} periods failed",
                overall.failed_periods.len(),
                periods.len()
            ));
        }
        overall.finished_at = Utc::now();
        self.record_run(overall.clone()).await;
        overall
    }

    /// Detect over the configured lookback, then recover every outage
    /// window. Explicit no-op when nothing is missing.
    pub async fn auto_recover_all(&self) -> RecoveryRun {
        let lookback_days = self.config.read().await.outage_lookback_days;
        let outage = self.detect_outage(lookback_days).await;

        if !outage.detected {
            log::info!(
                "No missing data in the last {} day(s), auto-recovery not needed",
                lookback_days
            );
            let mut run = RecoveryRun::begin(Vec::new());
            let mut step = RecoveryStep::begin("detect-outage");
            step.finish_ok("no missing data detected".to_string());
            run.steps.push(step);
            run.outcome = RecoveryOutcome::Success;
            run.finished_at = Utc::now();
            self.record_run(run.clone()).await;
            return run;
        }

        let periods: Vec<(DateTime<Utc>, DateTime<Utc>)> =
            outage.windows.iter().map(|w| (w.start, w.end)).collect();
        self.recover_multiple(&periods, false).await
    }

    /// True when the range has no missing slices.
    pub async fn validate_integrity(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.detect_missing_periods(start, end).await.is_empty()
    }

    pub async fn generate_integrity_report(&self, check_days: i64) -> IntegrityReport {
        let now = Utc::now();
        let end = now;
        let start = end - Duration::days(check_days.max(1));

        let (slice_minutes, excluded) = {
            let cfg = self.config.read().await;
            (cfg.slice_minutes.max(1), cfg.excluded_author_ids.clone())
        };

        let mut findings = Vec::new();
        let missing = self.detect_missing_periods(start, end).await;
        for period in &missing {
            findings.push(IntegrityFinding {
                period: period.clone(),
                severity: severity_of(period, now),
                recommended_action: format!(
                    "Run recovery for {}",
                    period_id(period.start, period.end)
                ),
            });
        }

        // Day-level reward gaps: a full day whose regular lookback holds
        // rewardable posts but which has no reward records.
        let mut reward_gaps = 0usize;
        let mut day = start.date_naive();
        loop {
            let day_start = day.and_time(NaiveTime::MIN).and_utc();
            let day_end = day_start + Duration::days(1);
            if day_end > end {
                break;
            }
            if day_start >= start {
                let lookback = self
                    .ingest
                    .query_by_range(day_start - Duration::days(1), day_start)
                    .await;
                let rewardable = lookback.iter().any(|p| {
                    p.kind == PostKind::Original && !excluded.contains(&p.author_id)
                });
                if rewardable && !self.rewards.has_records_for_date(day).await {
                    reward_gaps += 1;
                    let period = MissingPeriod {
                        start: day_start,
                        end: day_end,
                        kind: MissingKind::RewardData,
                    };
                    findings.push(IntegrityFinding {
                        severity: severity_of(&period, now),
                        recommended_action: format!("Recompute rewards for {}", day),
                        period,
                    });
                }
            }
            day = day + Duration::days(1);
        }

        let expected_slices =
            slice_count(start, end, slice_minutes);
        let report = IntegrityReport {
            generated_at: now,
            checked_from: start,
            checked_to: end,
            complete: findings.is_empty(),
            expected_slices,
            valid_slices: expected_slices.saturating_sub(missing.len()),
            missing_slices: missing.len(),
            recommendations: build_recommendations(missing.len(), reward_gaps),
            findings,
        };

        log::info!(
            "Integrity report for {}: complete={}, valid {}/{} slices, {} reward gap(s)",
            self.campaign,
            report.complete,
            report.valid_slices,
            report.expected_slices,
            reward_gaps
        );
        report
    }

    pub async fn run_history(&self, days: i64) -> Vec<RecoveryRun> {
        let cutoff = Utc::now() - Duration::days(days);
        let history = self.history.lock().await;
        let mut runs: Vec<RecoveryRun> = history
            .iter()
            .filter(|r| r.started_at >= cutoff)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    pub async fn status(&self) -> RecoveryHealth {
        let history = self.history.lock().await;
        let recent_failures = history
            .iter()
            .filter(|r| {
                r.outcome != RecoveryOutcome::Success
                    && r.started_at > Utc::now() - Duration::hours(24)
            })
            .count();

        let mut warnings = Vec::new();
        if recent_failures > 0 {
            warnings.push(format!(
                "{} recovery run(s) failed in the last 24 hours",
                recent_failures
            ));
        }

        RecoveryHealth {
            healthy: recent_failures < 5,
            total_runs: history.len(),
            recent_failures,
            last_run_at: history.last().map(|r| r.started_at),
            warnings,
        }
    }

    async fn record_run(&self, run: RecoveryRun) {
        let mut history = self.history.lock().await;
        history.push(run);
        if history.len() > RUN_HISTORY_KEEP {
            let excess = history.len() - RUN_HISTORY_KEEP;
            history.drain(..excess);
        }
    }
}

fn clamp_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    slice_minutes: i64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.min(Utc::now());
    if start >= end {
        let err = MentionRewardsError::Validation(format!(
            "inspection range starts at or after its end ({} >= {})",
            start, end
        ));
        log::warn!("{}; clamping to one slice", err);
        return (end - Duration::minutes(slice_minutes), end);
    }
    (start, end)
}

/// Missing slices separated by at most `gap_minutes` fold into one window.
fn coalesce_outages(missing: &[MissingPeriod], gap_minutes: i64) -> Vec<OutageWindow> {
    let mut sorted: Vec<&MissingPeriod> = missing.iter().collect();
    sorted.sort_by_key(|p| p.start);

    let mut windows: Vec<OutageWindow> = Vec::new();
    for period in sorted {
        match windows.last_mut() {
            Some(last) if period.start - last.end <= Duration::minutes(gap_minutes) => {
                if period.end > last.end {
                    last.end = period.end;
                }
            }
            _ => windows.push(OutageWindow {
                start: period.start,
                end: period.end,
            }),
        }
    }
    windows
}

fn build_plan(missing: &[MissingPeriod], windows: &[OutageWindow]) -> String {
    if missing.is_empty() {
        return "No recovery needed - all data is present".to_string();
    }

    let post_gaps = missing
        .iter()
        .filter(|p| p.kind == MissingKind::PostData)
        .count();
    let reward_gaps = missing
        .iter()
        .filter(|p| p.kind == MissingKind::RewardData)
        .count();

    let mut plan = format!(
        "Recovery plan: {} outage window(s) covering {} missing slice(s).\n",
        windows.len(),
        missing.len()
    );
    if post_gaps > 0 {
        plan.push_str(&format!("1. Refetch posts for {} slice(s)\n", post_gaps));
    }
    if reward_gaps > 0 {
        plan.push_str(&format!(
            "2. Recompute rewards for {} period(s)\n",
            reward_gaps
        ));
    }
    plan.push_str("3. Validate integrity afterwards\n");
    plan.push_str(&format!(
        "Estimated time: {} minute(s)",
        missing.len() as i64 * 2
    ));
    plan
}

fn build_recommendations(missing_slices: usize, reward_gaps: usize) -> String {
    let mut recommendations = Vec::new();
    if missing_slices > 0 {
        recommendations.push(format!(
            "Execute recovery for {} missing slice(s)",
            missing_slices
        ));
    }
    if reward_gaps > 0 {
        recommendations.push(format!(
            "Recompute rewards for {} day(s) without records",
            reward_gaps
        ));
    }
    if recommendations.is_empty() {
        recommendations.push("No immediate action required".to_string());
    }
    recommendations.join("; ")
}

fn severity_of(period: &MissingPeriod, now: DateTime<Utc>) -> Severity {
    let age = now - period.start;
    if age < Duration::hours(24) {
        Severity::High
    } else if age < Duration::days(3) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn outcome_from_steps(steps: &[RecoveryStep]) -> RecoveryOutcome {
    let ok = steps.iter().filter(|s| s.ok).count();
    if ok == steps.len() {
        RecoveryOutcome::Success
    } else if ok > 0 {
        RecoveryOutcome::Partial
    } else {
        RecoveryOutcome::Failed
    }
}

fn slice_count(start: DateTime<Utc>, end: DateTime<Utc>, slice_minutes: i64) -> usize {
    let span_minutes = (end - start).num_minutes().max(0);
    ((span_minutes + slice_minutes - 1) / slice_minutes) as usize
}

fn period_id(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("{}..{}", start.to_rfc3339(), end.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{IdentityResolver, RewardLedger};
    use crate::testing::{test_config, MemoryStateStore, MockLedger, MockProvider, ScriptedPost};
    use chrono::TimeZone;

    struct Harness {
        ingest: Arc<IngestScheduler>,
        recovery: Arc<RecoveryEngine>,
        provider: Arc<MockProvider>,
    }

    async fn harness(posts: Vec<ScriptedPost>) -> Harness {
        let provider = Arc::new(MockProvider::with_posts(posts));
        let store = Arc::new(MemoryStateStore::default());
        let ledger = Arc::new(MockLedger::default());
        let shared = test_config().shared();

        let ingest = IngestScheduler::load(
            "campaign-1",
            shared.clone(),
            provider.clone(),
            store.clone(),
        )
        .await
        .unwrap();

        let rewards = RewardEngine::load(
            "campaign-1",
            shared.clone(),
            provider.clone(),
            ledger.clone() as Arc<dyn RewardLedger>,
            ledger as Arc<dyn IdentityResolver>,
            ingest.clone(),
            store,
        )
        .await
        .unwrap();

        let recovery = RecoveryEngine::new("campaign-1", shared, ingest.clone(), rewards);

        Harness {
            ingest,
            recovery,
            provider,
        }
    }

    fn slice(start_min: i64, base: DateTime<Utc>) -> MissingPeriod {
        MissingPeriod {
            start: base + Duration::minutes(start_min),
            end: base + Duration::minutes(start_min + 30),
            kind: MissingKind::PostData,
        }
    }

    #[test]
    fn slices_forty_minutes_apart_merge_into_one_window() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        // Gap between first slice end (0:30) and second slice start (1:10)
        // is 40 minutes.
        let missing = vec![slice(0, base), slice(70, base)];

        let windows = coalesce_outages(&missing, 60);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, base);
        assert_eq!(windows[0].end, base + Duration::minutes(100));
    }

    #[test]
    fn slices_ninety_minutes_apart_stay_separate() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let missing = vec![slice(0, base), slice(120, base)];

        let windows = coalesce_outages(&missing, 60);
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn outcome_requires_every_step() {
        let mut ok = RecoveryStep::begin("a");
        ok.finish_ok("done".into());
        let mut bad = RecoveryStep::begin("b");
        bad.finish_err("boom".into());

        assert_eq!(
            outcome_from_steps(&[ok.clone(), ok.clone()]),
            RecoveryOutcome::Success
        );
        assert_eq!(
            outcome_from_steps(&[ok.clone(), bad.clone()]),
            RecoveryOutcome::Partial
        );
        assert_eq!(outcome_from_steps(&[bad.clone(), bad]), RecoveryOutcome::Failed);
    }

    #[tokio::test]
    async fn detects_slices_without_stored_posts() {
        let now = Utc::now();
        let base = now - Duration::hours(4);
        let h = harness(vec![ScriptedPost::original(
            "p1",
            "a1",
            base + Duration::minutes(10),
        )])
        .await;

        h.ingest
            .fetch_range(base, base + Duration::hours(2))
            .await
            .unwrap();

        let missing = h
            .recovery
            .detect_missing_periods(base, base + Duration::hours(2))
            .await;
        // Four 30-minute slices, only the first holds a record.
        assert_eq!(missing.len(), 3);
        assert_eq!(missing[0].start, base + Duration::minutes(30));
        assert!(missing.iter().all(|m| m.kind == MissingKind::PostData));
    }

    #[tokio::test]
    async fn invalid_inspection_range_is_clamped() {
        let h = harness(Vec::new()).await;
        let now = Utc::now();

        let missing = h
            .recovery
            .detect_missing_periods(now + Duration::hours(2), now + Duration::hours(1))
            .await;
        assert!(missing.len() <= 1);
    }

    #[tokio::test]
    async fn recovery_fills_a_previously_empty_window() {
        let now = Utc::now();
        let start = now - Duration::hours(3);
        let end = start + Duration::minutes(30);

        let h = harness(vec![ScriptedPost::original(
            "p1",
            "a1",
            start + Duration::minutes(5),
        )])
        .await;

        // Nothing was ever ingested for the window.
        assert!(!h.recovery.validate_integrity(start, end).await);

        let run = h.recovery.recover_period(start, end, false).await;
        assert_eq!(run.outcome, RecoveryOutcome::Success);
        assert_eq!(run.recovered_posts, 1);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps.iter().all(|s| s.ok));

        assert_eq!(h.ingest.query_by_range(start, end).await.len(), 1);
        assert!(h.recovery.validate_integrity(start, end).await);
    }

    #[tokio::test]
    async fn failed_period_does_not_abort_the_others() {
        let now = Utc::now();
        let good_start = now - Duration::hours(6);
        let good_end = good_start + Duration::minutes(30);
        let bad_start = now - Duration::hours(2);
        let bad_end = bad_start + Duration::minutes(30);

        let h = harness(vec![ScriptedPost::original(
            "p1",
            "a1",
            good_start + Duration::minutes(5),
        )])
        .await;
        h.provider.fail_window(bad_start, bad_end);

        let run = h
            .recovery
            .recover_multiple(&[(good_start, good_end), (bad_start, bad_end)], false)
            .await;

        assert_eq!(run.outcome, RecoveryOutcome::Partial);
        assert_eq!(run.recovered_posts, 1);
        assert_eq!(run.failed_periods.len(), 1);
    }

    #[tokio::test]
    async fn auto_recovery_is_a_noop_when_nothing_is_missing() {
        let now = Utc::now();
        // One post per 30-minute slice across the whole lookback window.
        let lookback_start = now - Duration::days(7) - Duration::hours(1);
        let posts = (0..((7 * 48) + 3) as i64)
            .map(|i| {
                ScriptedPost::original(
                    &format!("p{}", i),
                    &format!("a{}", i % 40),
                    lookback_start + Duration::minutes(i * 30 + 1),
                )
            })
            .collect();

        let h = harness(posts).await;
        h.ingest.fetch_range(lookback_start, now).await.unwrap();

        let outage = h.recovery.detect_outage(7).await;
        assert!(!outage.detected);
        assert_eq!(outage.plan, "No recovery needed - all data is present");

        let run = h.recovery.auto_recover_all().await;
        assert_eq!(run.outcome, RecoveryOutcome::Success);
        assert_eq!(run.recovered_posts, 0);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(h.recovery.run_history(1).await.len(), 1);
    }
}
