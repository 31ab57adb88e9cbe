use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::alerts::Alert;
use crate::reading::Reading;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// An alert row as read back for the API.
#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub id: i64,
    #[serde(rename = "type")]
    pub severity: String,
    pub category: String,
    pub title: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub acknowledged: bool,
}

/// Outcome of a one-shot alert state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    AlreadyDone,
    NotFound,
}

type AlertRow = (i64, String, String, String, String, i64, Option<i64>);

impl Db {
    /// db_url examples:
    /// - "sqlite:greenhouse.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // every connection to :memory: is its own database
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (
              ts, temperature, humidity, soil_moisture, co2_level,
              light_level, ph_level, nutrient_level
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp().unix_timestamp())
        .bind(r.temperature())
        .bind(r.humidity())
        .bind(r.soil_moisture())
        .bind(r.co2_level())
        .bind(r.light_level())
        .bind(r.ph_level())
        .bind(r.nutrient_level())
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn count_readings(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")?;
        Ok(n)
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, a: &Alert) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO alerts (severity, category, title, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.severity.as_str())
        .bind(a.category.as_str())
        .bind(a.title.as_str())
        .bind(a.message.as_str())
        .bind(a.created_at.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn acknowledge_alert(&self, id: i64, at: OffsetDateTime) -> Result<Transition> {
        let res = sqlx::query(
            "UPDATE alerts SET acknowledged_at = ? WHERE id = ? AND acknowledged_at IS NULL",
        )
        .bind(at.unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("acknowledge_alert failed")?;
        self.transition(id, res.rows_affected()).await
    }

    pub async fn resolve_alert(&self, id: i64, at: OffsetDateTime) -> Result<Transition> {
        let res =
            sqlx::query("UPDATE alerts SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL")
                .bind(at.unix_timestamp())
                .bind(id)
                .execute(&self.pool)
                .await
                .context("resolve_alert failed")?;
        self.transition(id, res.rows_affected()).await
    }

    async fn transition(&self, id: i64, rows: u64) -> Result<Transition> {
        if rows > 0 {
            return Ok(Transition::Applied);
        }
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("alert lookup failed")?;
        Ok(match found {
            Some(_) => Transition::AlreadyDone,
            None => Transition::NotFound,
        })
    }

    /// Unresolved alerts, newest first.
    pub async fn active_alerts(&self, limit: i64) -> Result<Vec<StoredAlert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, severity, category, title, message, created_at, acknowledged_at
            FROM alerts
            WHERE resolved_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("active_alerts failed")?;

        rows.into_iter()
            .map(|(id, severity, category, title, message, created_at, ack)| {
                Ok(StoredAlert {
                    id,
                    severity,
                    category,
                    title,
                    message,
                    created_at: OffsetDateTime::from_unix_timestamp(created_at)
                        .with_context(|| format!("bad created_at on alert {id}"))?,
                    acknowledged: ack.is_some(),
                })
            })
            .collect()
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Delete readings and alerts created before `cutoff`. Returns rows removed.
    pub async fn purge_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let ts = cutoff.unix_timestamp();
        let readings = sqlx::query("DELETE FROM readings WHERE ts < ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("purge readings failed")?;
        let alerts = sqlx::query("DELETE FROM alerts WHERE created_at < ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("purge alerts failed")?;
        Ok(readings.rows_affected() + alerts.rows_affected())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
