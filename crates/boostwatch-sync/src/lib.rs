//! Tracked-metric polling protocol.
//!
//! One generalized loop covers everything the bot watches: fetch the page,
//! parse a snapshot, gate on a cheap fingerprint, fold the snapshot into the
//! weekly ledger, and reconcile the pinned summary message. The club and
//! alliance trackers are two instantiations of the same loop with different
//! parse sections and render styles; the featured-card tracker is the
//! single-item variant that emits one-shot change notifications instead of a
//! maintained summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use boostwatch_adapters::{parse_contributions, parse_featured, Section};
use boostwatch_core::{
    snapshot_fingerprint, week, ContributionRecord, FeaturedItem, LedgerEntry,
    PinnedMessageRecord,
};
use boostwatch_notify::{ChatTarget, DeliveryError, Notifier, TelegramNotifier};
use boostwatch_storage::{
    FetcherConfig, NetworkRotation, NoopRotation, PageFetcher, RetryPolicy, Store, StorageError,
};

pub const CRATE_NAME: &str = "boostwatch-sync";

pub const CLUB_METRIC: &str = "club_week";
pub const ALLIANCE_METRIC: &str = "alliance_week";

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub database_path: PathBuf,
    pub base_url: String,
    pub club_stats_path: String,
    pub boost_path: String,
    pub alliance_path: String,
    pub alliance_section: String,
    pub poll_interval_secs: u64,
    pub alliance_interval_secs: u64,
    pub chat_id: i64,
    pub club_thread_id: Option<i64>,
    pub alliance_thread_id: Option<i64>,
    pub bot_token: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub failure_threshold: u32,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("BOOSTWATCH_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./bot_data.db")),
            base_url: env_or("BOOSTWATCH_BASE_URL", "https://mangabuff.ru"),
            club_stats_path: env_or(
                "BOOSTWATCH_CLUB_STATS_PATH",
                "/clubs/getTopUsers?period=week",
            ),
            boost_path: env_or("BOOSTWATCH_BOOST_PATH", "/clubs/boost"),
            alliance_path: env_or("BOOSTWATCH_ALLIANCE_PATH", "/alliances/45/boost"),
            alliance_section: env_or("BOOSTWATCH_ALLIANCE_SECTION", "club64"),
            poll_interval_secs: env_parse("BOOSTWATCH_POLL_INTERVAL_SECS").unwrap_or(60),
            alliance_interval_secs: env_parse("BOOSTWATCH_ALLIANCE_INTERVAL_SECS").unwrap_or(120),
            chat_id: env_parse("BOOSTWATCH_CHAT_ID").unwrap_or(0),
            club_thread_id: env_parse("BOOSTWATCH_CLUB_THREAD_ID"),
            alliance_thread_id: env_parse("BOOSTWATCH_ALLIANCE_THREAD_ID"),
            bot_token: env_or("BOOSTWATCH_BOT_TOKEN", ""),
            http_timeout_secs: env_parse("BOOSTWATCH_HTTP_TIMEOUT_SECS").unwrap_or(15),
            user_agent: env_or("BOOSTWATCH_USER_AGENT", "boostwatch/0.1"),
            failure_threshold: env_parse("BOOSTWATCH_FAILURE_THRESHOLD").unwrap_or(5),
        }
    }

    fn page_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ── Metric description and rendering ─────────────────────────────────

/// How ledger rows are presented in the pinned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStyle {
    /// One line per entity with its current total. Used where the source
    /// counter itself resets weekly.
    Totals,
    /// Start-of-week, current and growth per entity. Used where the source
    /// counter accumulates forever and only the delta is meaningful.
    Growth,
}

/// Everything that distinguishes one tracked metric from another.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub key: &'static str,
    pub url: String,
    pub section: Section,
    pub target: ChatTarget,
    pub style: RenderStyle,
    pub title: String,
}

fn medal_prefix(position: usize) -> String {
    match position {
        1 => "🥇".to_string(),
        2 => "🥈".to_string(),
        3 => "🥉".to_string(),
        n => format!("<b>{n}.</b>"),
    }
}

fn linked_name(display_name: &str, profile_url: Option<&str>) -> String {
    match profile_url {
        Some(url) => format!("<a href=\"{url}\">{display_name}</a>"),
        None => display_name.to_string(),
    }
}

/// Renders the pinned weekly summary as Telegram HTML.
pub fn render_week_message(
    title: &str,
    style: RenderStyle,
    rows: &[LedgerEntry],
    week_start: NaiveDate,
) -> String {
    let range = week::format_week_range(week_start);
    if rows.is_empty() {
        return format!("{title} ({range})\n\nNo contributions yet this week.");
    }

    let lines: Vec<String> = rows
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let prefix = medal_prefix(index + 1);
            let name = linked_name(&entry.display_name, entry.profile_url.as_deref());
            match style {
                RenderStyle::Totals => format!("{prefix} {name} — {}", entry.current),
                RenderStyle::Growth => format!(
                    "{prefix} {name}\n   📌 Start: {}  →  {}  <b>({:+})</b>",
                    entry.baseline,
                    entry.current,
                    entry.delta()
                ),
            }
        })
        .collect();

    let separator = match style {
        RenderStyle::Totals => "\n",
        RenderStyle::Growth => "\n\n",
    };
    let stamp = week::format_update_stamp(Utc::now());
    format!(
        "{title} ({range})\n\n{}\n\n🕐 <i>Updated: {stamp}</i>",
        lines.join(separator)
    )
}

/// One-shot notification for a featured-item rotation.
pub fn render_featured_notice(item: &FeaturedItem) -> String {
    let name = match &item.image_url {
        Some(url) => format!("<a href=\"{url}\">{}</a>", item.display_name),
        None => item.display_name.clone(),
    };
    let mut lines = vec![format!("🔄 <b>New featured card</b>\n\n{name}")];
    if let Some(replacements) = &item.replacements {
        lines.push(format!("♻️ Replacements: {replacements}"));
    }
    if let Some(donated) = &item.daily_donated {
        lines.push(format!("📥 Donated today: {donated}"));
    }
    lines.join("\n")
}

// ── Pinned message reconciliation ────────────────────────────────────

/// Keeps exactly one live pinned message per (chat, metric).
///
/// Best-effort by contract: every failure path is logged and swallowed so a
/// delivery problem can never abort the polling loop.
pub struct PinnedReconciler {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl PinnedReconciler {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn reconcile(
        &self,
        metric: &str,
        target: ChatTarget,
        week_start: NaiveDate,
        text: &str,
    ) {
        let existing = match self.store.pinned_message(metric, target.chat_id).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(metric, error = %err, "could not load pinned message record");
                return;
            }
        };

        // A record from another week is stale: never edit last week's post
        // into this week's data, recreate instead.
        let existing = match existing {
            Some(record) if record.week_start != week_start => {
                info!(
                    metric,
                    from = %record.week_start,
                    to = %week_start,
                    "week changed, creating a fresh pinned message"
                );
                if let Err(err) = self.store.clear_pinned_message(metric, target.chat_id).await {
                    warn!(metric, error = %err, "could not clear stale pinned record");
                }
                None
            }
            other => other,
        };

        if let Some(record) = existing {
            match self
                .notifier
                .edit(target.chat_id, record.message_id, text)
                .await
            {
                Ok(()) => {
                    self.save_record(metric, target, record.message_id, week_start)
                        .await;
                    return;
                }
                Err(DeliveryError::NotModified) => {
                    debug!(metric, "pinned message text unchanged");
                    return;
                }
                Err(DeliveryError::NotFound) => {
                    warn!(metric, "pinned message was deleted externally, resending");
                }
                Err(err) => {
                    warn!(metric, error = %err, "could not edit pinned message");
                    return;
                }
            }
        }

        match self.notifier.send(target, text).await {
            Ok(message_id) => {
                if let Err(err) = self.notifier.pin(target.chat_id, message_id).await {
                    warn!(metric, error = %err, "could not pin message, keeping it unpinned");
                }
                self.save_record(metric, target, message_id, week_start).await;
                info!(metric, message_id, "fresh pinned message created");
            }
            Err(err) => {
                warn!(metric, error = %err, "could not send pinned message");
            }
        }
    }

    async fn save_record(
        &self,
        metric: &str,
        target: ChatTarget,
        message_id: i64,
        week_start: NaiveDate,
    ) {
        let record = PinnedMessageRecord {
            chat_id: target.chat_id,
            thread_id: target.thread_id,
            message_id,
            week_start,
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.save_pinned_message(metric, &record).await {
            warn!(metric, error = %err, "could not persist pinned message record");
        }
    }
}

// ── Failure accounting ───────────────────────────────────────────────

/// Counts consecutive fetch failures; reports when the escalation threshold
/// is reached and resets itself afterwards.
#[derive(Debug)]
struct FailureGate {
    consecutive: u32,
    threshold: u32,
}

impl FailureGate {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

// ── Contribution tracker ─────────────────────────────────────────────

/// Explicit per-metric loop state, owned by the tracker task and threaded
/// through each iteration.
#[derive(Debug)]
struct MetricState {
    last_fingerprint: Option<String>,
    last_week: NaiveDate,
    failures: FailureGate,
}

pub struct ContributionTracker {
    spec: MetricSpec,
    store: Store,
    fetcher: Arc<PageFetcher>,
    reconciler: PinnedReconciler,
    rotation: Arc<dyn NetworkRotation>,
    interval: Duration,
    base_url: String,
    failure_threshold: u32,
}

impl ContributionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: MetricSpec,
        store: Store,
        fetcher: Arc<PageFetcher>,
        notifier: Arc<dyn Notifier>,
        rotation: Arc<dyn NetworkRotation>,
        interval: Duration,
        base_url: String,
        failure_threshold: u32,
    ) -> Self {
        let reconciler = PinnedReconciler::new(store.clone(), notifier);
        Self {
            spec,
            store,
            fetcher,
            reconciler,
            rotation,
            interval,
            base_url,
            failure_threshold,
        }
    }

    /// Runs until the shutdown signal flips. One bad iteration is logged and
    /// absorbed; the loop itself never dies.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(metric = self.spec.key, url = %self.spec.url, "contribution tracker started");
        let mut state = MetricState {
            last_fingerprint: None,
            last_week: week::current_week_start(),
            failures: FailureGate::new(self.failure_threshold),
        };

        // Seed once at startup so the pinned message is current before the
        // first interval elapses.
        if let Err(err) = self.tick(&mut state).await {
            warn!(metric = self.spec.key, error = %err, "startup poll failed");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!(metric = self.spec.key, "contribution tracker stopped");
                    return;
                }
            }
            if let Err(err) = self.tick(&mut state).await {
                warn!(
                    metric = self.spec.key,
                    error = %err,
                    "poll cycle failed, retrying next interval"
                );
            }
        }
    }

    async fn tick(&self, state: &mut MetricState) -> Result<()> {
        let cycle_id = Uuid::new_v4();
        let html = match self.fetcher.fetch_text(cycle_id, &self.spec.url).await {
            Ok(html) => {
                state.failures.success();
                html
            }
            Err(err) => {
                warn!(metric = self.spec.key, error = %err, "fetch failed, skipping cycle");
                if state.failures.failure() {
                    warn!(
                        metric = self.spec.key,
                        "persistent fetch failures, requesting network rotation"
                    );
                    self.rotation.notify_failure();
                }
                return Ok(());
            }
        };

        let records = parse_contributions(&html, &self.spec.section, &self.base_url);
        self.process_snapshot(state, &records, week::current_week_start())
            .await
    }

    /// Ledger and message work for one observed snapshot.
    ///
    /// The fingerprint gate makes the unchanged case (the dominant one) a
    /// no-op; a week roll-over bypasses the gate and resets baselines.
    async fn process_snapshot(
        &self,
        state: &mut MetricState,
        records: &[ContributionRecord],
        current_week: NaiveDate,
    ) -> Result<()> {
        if records.is_empty() {
            debug!(metric = self.spec.key, "no records this round");
            return Ok(());
        }

        let fingerprint = snapshot_fingerprint(records);
        let week_changed = current_week != state.last_week;
        if !week_changed && state.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }

        if week_changed {
            info!(
                metric = self.spec.key,
                from = %state.last_week,
                to = %current_week,
                "week rolled over, rolling baselines forward"
            );
        }

        self.store
            .upsert_week(self.spec.key, current_week, records, week_changed)
            .await?;
        let rows = self.store.week_rows(self.spec.key, current_week).await?;
        let text = render_week_message(&self.spec.title, self.spec.style, &rows, current_week);
        self.reconciler
            .reconcile(self.spec.key, self.spec.target, current_week, &text)
            .await;

        state.last_week = current_week;
        state.last_fingerprint = Some(fingerprint);
        Ok(())
    }
}

// ── Featured item tracker ────────────────────────────────────────────

/// Single-item variant of the poll loop: watches which item is featured and
/// pushes a one-shot notification when it rotates.
pub struct FeaturedTracker {
    url: String,
    store: Store,
    fetcher: Arc<PageFetcher>,
    notifier: Arc<dyn Notifier>,
    rotation: Arc<dyn NetworkRotation>,
    target: ChatTarget,
    interval: Duration,
    base_url: String,
    failure_threshold: u32,
}

impl FeaturedTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        store: Store,
        fetcher: Arc<PageFetcher>,
        notifier: Arc<dyn Notifier>,
        rotation: Arc<dyn NetworkRotation>,
        target: ChatTarget,
        interval: Duration,
        base_url: String,
        failure_threshold: u32,
    ) -> Self {
        Self {
            url,
            store,
            fetcher,
            notifier,
            rotation,
            target,
            interval,
            base_url,
            failure_threshold,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, "featured item tracker started");
        let mut failures = FailureGate::new(self.failure_threshold);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("featured item tracker stopped");
                    return;
                }
            }
            if let Err(err) = self.tick(&mut failures).await {
                warn!(error = %err, "featured poll cycle failed, retrying next interval");
            }
        }
    }

    async fn tick(&self, failures: &mut FailureGate) -> Result<()> {
        let cycle_id = Uuid::new_v4();
        let html = match self.fetcher.fetch_text(cycle_id, &self.url).await {
            Ok(html) => {
                failures.success();
                html
            }
            Err(err) => {
                warn!(error = %err, "featured page fetch failed, skipping cycle");
                if failures.failure() {
                    warn!("persistent fetch failures, requesting network rotation");
                    self.rotation.notify_failure();
                }
                return Ok(());
            }
        };

        let Some(item) = parse_featured(&html, &self.base_url) else {
            debug!("no featured item found on page");
            return Ok(());
        };
        self.process_item(item).await
    }

    /// Archives the previous current item and announces the new one. A no-op
    /// when the featured item has not changed.
    async fn process_item(&self, item: FeaturedItem) -> Result<()> {
        let current = self.store.current_featured().await?;
        if current.as_ref().map(|c| c.item_id) == Some(item.item_id) {
            return Ok(());
        }

        info!(
            previous = current.as_ref().map(|c| c.item_id),
            new = item.item_id,
            "featured item changed"
        );
        self.store.replace_featured(&item).await?;

        let text = render_featured_notice(&item);
        if let Err(err) = self.notifier.send(self.target, &text).await {
            warn!(error = %err, "featured change notification failed");
        }
        Ok(())
    }
}

// ── Reports ──────────────────────────────────────────────────────────

/// Plain-text rendering of one stored week, newest contributors first.
pub async fn report_week_text(
    store: &Store,
    metric: &str,
    week_start: NaiveDate,
) -> Result<String, StorageError> {
    let rows = store.week_rows(metric, week_start).await?;
    let header = format!("Week {week_start} ({})", week::format_week_range(week_start));
    if rows.is_empty() {
        return Ok(format!("{header}\n\nNo contributions recorded for this week."));
    }
    let lines = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            format!(
                "{:>2}. {} — {} ({:+})",
                index + 1,
                row.display_name,
                row.current,
                row.delta()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!("{header}\n\n{lines}"))
}

/// Plain-text listing of every week with stored data, newest first.
pub async fn list_weeks_text(store: &Store, metric: &str) -> Result<String, StorageError> {
    let weeks = store.available_weeks(metric).await?;
    if weeks.is_empty() {
        return Ok("No stored weeks.".to_string());
    }
    let lines = weeks
        .iter()
        .map(|start| format!("{start} ({})", week::format_week_range(*start)))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!("Stored weeks ({}):\n{lines}", weeks.len()))
}

// ── Wiring ───────────────────────────────────────────────────────────

pub async fn run_from_env(shutdown: watch::Receiver<bool>) -> Result<()> {
    let config = WatchConfig::from_env();
    run_with_config(config, shutdown, Arc::new(NoopRotation)).await
}

/// Builds and runs all three trackers against one store and one fetcher
/// until the shutdown signal flips. Trackers touch disjoint metric keys, so
/// they share the pool without coordination.
pub async fn run_with_config(
    config: WatchConfig,
    shutdown: watch::Receiver<bool>,
    rotation: Arc<dyn NetworkRotation>,
) -> Result<()> {
    anyhow::ensure!(
        !config.bot_token.is_empty(),
        "BOOSTWATCH_BOT_TOKEN is not set"
    );
    anyhow::ensure!(config.chat_id != 0, "BOOSTWATCH_CHAT_ID is not set");

    let store = Store::open(&config.database_path).await?;
    let fetcher = Arc::new(PageFetcher::new(FetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        retry: RetryPolicy::default(),
    })?);
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(&config.bot_token));

    let club = ContributionTracker::new(
        MetricSpec {
            key: CLUB_METRIC,
            url: config.page_url(&config.club_stats_path),
            section: Section::Document,
            target: ChatTarget {
                chat_id: config.chat_id,
                thread_id: config.club_thread_id,
            },
            style: RenderStyle::Totals,
            title: "📊 <b>Weekly top contributors</b>".to_string(),
        },
        store.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&notifier),
        Arc::clone(&rotation),
        Duration::from_secs(config.poll_interval_secs),
        config.base_url.clone(),
        config.failure_threshold,
    );

    let alliance = ContributionTracker::new(
        MetricSpec {
            key: ALLIANCE_METRIC,
            url: config.page_url(&config.alliance_path),
            section: Section::DataPage(config.alliance_section.clone()),
            target: ChatTarget {
                chat_id: config.chat_id,
                thread_id: config.alliance_thread_id,
            },
            style: RenderStyle::Growth,
            title: "🏰 <b>Club contribution to the alliance</b>".to_string(),
        },
        store.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&notifier),
        Arc::clone(&rotation),
        Duration::from_secs(config.alliance_interval_secs),
        config.base_url.clone(),
        config.failure_threshold,
    );

    let featured = FeaturedTracker::new(
        config.page_url(&config.boost_path),
        store.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&notifier),
        Arc::clone(&rotation),
        ChatTarget {
            chat_id: config.chat_id,
            thread_id: config.club_thread_id,
        },
        Duration::from_secs(config.poll_interval_secs),
        config.base_url.clone(),
        config.failure_threshold,
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(club.run(shutdown.clone()));
    tasks.spawn(alliance.run(shutdown.clone()));
    tasks.spawn(featured.run(shutdown));

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            error!(error = %err, "tracker task aborted");
        }
    }
    info!("all trackers stopped");
    Ok(())
}
