//! Durable ledger and message state over SQLite, plus HTTP fetch utilities.
//!
//! Every write is a short-lived single-statement upsert keyed by
//! `(metric, week_start, entity_id)`, so concurrent tracker loops touching
//! disjoint metrics need no application-level locking. A partially applied
//! batch self-heals on the next successful poll.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use boostwatch_core::{ContributionRecord, FeaturedItem, LedgerEntry, PinnedMessageRecord};
use chrono::{NaiveDate, Utc};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "boostwatch-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Pooled handle over the bot database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database file and ensures the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS weekly_contributions (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                metric        TEXT NOT NULL,
                week_start    TEXT NOT NULL,
                entity_id     INTEGER NOT NULL,
                display_name  TEXT NOT NULL,
                profile_url   TEXT,
                baseline      INTEGER NOT NULL DEFAULT 0,
                current       INTEGER NOT NULL DEFAULT 0,
                updated_at    TEXT NOT NULL,
                UNIQUE(metric, week_start, entity_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_weekly_metric_week
             ON weekly_contributions(metric, week_start, current DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pinned_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                metric      TEXT NOT NULL,
                chat_id     INTEGER NOT NULL,
                thread_id   INTEGER,
                message_id  INTEGER NOT NULL,
                week_start  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE(metric, chat_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS featured_items (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id        INTEGER NOT NULL,
                display_name   TEXT NOT NULL,
                image_url      TEXT,
                replacements   TEXT,
                daily_donated  TEXT,
                owner_ids      TEXT NOT NULL DEFAULT '',
                archived       INTEGER NOT NULL DEFAULT 0,
                discovered_at  TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Contribution ledger ──────────────────────────────────────────

    /// Upserts one poll snapshot into the week's ledger.
    ///
    /// With `is_new_week` the baseline is rolled forward: `baseline` and
    /// `current` are both set to the observed value, replacing any stale row
    /// for the key. Without it, existing rows keep their baseline and only
    /// `current` moves; an entity first observed mid-week gets
    /// `baseline = current = observed`, so it shows zero growth until the
    /// next poll. That approximation is deliberate: its true start-of-week
    /// value is unknown.
    pub async fn upsert_week(
        &self,
        metric: &str,
        week_start: NaiveDate,
        records: &[ContributionRecord],
        is_new_week: bool,
    ) -> Result<(), StorageError> {
        let updated_at = Utc::now();
        let sql = if is_new_week {
            "INSERT INTO weekly_contributions
                (metric, week_start, entity_id, display_name, profile_url,
                 baseline, current, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(metric, week_start, entity_id) DO UPDATE SET
                display_name = excluded.display_name,
                profile_url  = excluded.profile_url,
                baseline     = excluded.baseline,
                current      = excluded.current,
                updated_at   = excluded.updated_at"
        } else {
            "INSERT INTO weekly_contributions
                (metric, week_start, entity_id, display_name, profile_url,
                 baseline, current, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(metric, week_start, entity_id) DO UPDATE SET
                display_name = excluded.display_name,
                profile_url  = excluded.profile_url,
                current      = excluded.current,
                updated_at   = excluded.updated_at"
        };
        for record in records {
            sqlx::query(sql)
                .bind(metric)
                .bind(week_start)
                .bind(record.entity_id)
                .bind(&record.display_name)
                .bind(&record.profile_url)
                .bind(record.contribution)
                .bind(record.contribution)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Ledger rows for one week, current-descending with stable arrival-order
    /// tie-breaks.
    pub async fn week_rows(
        &self,
        metric: &str,
        week_start: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT week_start, entity_id, display_name, profile_url,
                    baseline, current, updated_at
             FROM weekly_contributions
             WHERE metric = ? AND week_start = ?
             ORDER BY current DESC, id ASC",
        )
        .bind(metric)
        .bind(week_start)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    /// Distinct weeks with any ledger data, newest first.
    pub async fn available_weeks(&self, metric: &str) -> Result<Vec<NaiveDate>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT week_start FROM weekly_contributions
             WHERE metric = ?
             ORDER BY week_start DESC",
        )
        .bind(metric)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("week_start").map_err(StorageError::from))
            .collect()
    }

    // ── Pinned message records ───────────────────────────────────────

    pub async fn pinned_message(
        &self,
        metric: &str,
        chat_id: i64,
    ) -> Result<Option<PinnedMessageRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT chat_id, thread_id, message_id, week_start, updated_at
             FROM pinned_messages
             WHERE metric = ? AND chat_id = ?",
        )
        .bind(metric)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pinned_record_from_row).transpose()
    }

    pub async fn save_pinned_message(
        &self,
        metric: &str,
        record: &PinnedMessageRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO pinned_messages
                (metric, chat_id, thread_id, message_id, week_start, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(metric, chat_id) DO UPDATE SET
                thread_id  = excluded.thread_id,
                message_id = excluded.message_id,
                week_start = excluded.week_start,
                updated_at = excluded.updated_at",
        )
        .bind(metric)
        .bind(record.chat_id)
        .bind(record.thread_id)
        .bind(record.message_id)
        .bind(record.week_start)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops the stored record so the next reconcile sends a fresh message.
    pub async fn clear_pinned_message(
        &self,
        metric: &str,
        chat_id: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pinned_messages WHERE metric = ? AND chat_id = ?")
            .bind(metric)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Featured item ────────────────────────────────────────────────

    pub async fn current_featured(&self) -> Result<Option<FeaturedItem>, StorageError> {
        let row = sqlx::query(
            "SELECT item_id, display_name, image_url, replacements,
                    daily_donated, owner_ids, discovered_at
             FROM featured_items
             WHERE archived = 0
             ORDER BY id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(featured_from_row).transpose()
    }

    /// Archives the live item (kept for history) and inserts `item` as the
    /// new current one, in a single transaction.
    pub async fn replace_featured(&self, item: &FeaturedItem) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE featured_items SET archived = 1 WHERE archived = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO featured_items
                (item_id, display_name, image_url, replacements,
                 daily_donated, owner_ids, archived, discovered_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(item.item_id)
        .bind(&item.display_name)
        .bind(&item.image_url)
        .bind(&item.replacements)
        .bind(&item.daily_donated)
        .bind(encode_owner_ids(&item.owner_ids))
        .bind(item.discovered_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn ledger_entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, StorageError> {
    Ok(LedgerEntry {
        week_start: row.try_get("week_start")?,
        entity_id: row.try_get("entity_id")?,
        display_name: row.try_get("display_name")?,
        profile_url: row.try_get("profile_url")?,
        baseline: row.try_get("baseline")?,
        current: row.try_get("current")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn pinned_record_from_row(row: &SqliteRow) -> Result<PinnedMessageRecord, StorageError> {
    Ok(PinnedMessageRecord {
        chat_id: row.try_get("chat_id")?,
        thread_id: row.try_get("thread_id")?,
        message_id: row.try_get("message_id")?,
        week_start: row.try_get("week_start")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn featured_from_row(row: &SqliteRow) -> Result<FeaturedItem, StorageError> {
    let owner_ids: String = row.try_get("owner_ids")?;
    Ok(FeaturedItem {
        item_id: row.try_get("item_id")?,
        display_name: row.try_get("display_name")?,
        image_url: row.try_get("image_url")?,
        replacements: row.try_get("replacements")?,
        daily_donated: row.try_get("daily_donated")?,
        owner_ids: decode_owner_ids(&owner_ids),
        discovered_at: row.try_get("discovered_at")?,
    })
}

fn encode_owner_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_owner_ids(encoded: &str) -> Vec<i64> {
    encoded
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

// ── HTTP fetch ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with a fixed delay between attempts, shared by every
/// network-calling component.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Page fetcher with per-call timeout and bounded fixed-delay retry. Gives up
/// for the cycle after exhausting attempts; never blocks indefinitely.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_text(&self, cycle_id: Uuid, url: &str) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", %cycle_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Fire-and-forget hint that recent fetches keep failing. How rotation works
/// lives with the collaborator, not here.
pub trait NetworkRotation: Send + Sync {
    fn notify_failure(&self);
}

/// Used when no rotation collaborator is wired in.
#[derive(Debug, Default)]
pub struct NoopRotation;

impl NetworkRotation for NoopRotation {
    fn notify_failure(&self) {}
}
