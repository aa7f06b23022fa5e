//! Database layer: migrations, the event journal, job-run bookkeeping and
//! the organization directory. Engine aggregates live in [`crate::store`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use funding_engine::{Job, JobReport, OrganizationId, UserId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::journal::{JournalEntry, JournalRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` opens its own database, so keep exactly
    // one alive for the life of the pool.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Event journal
// ─────────────────────────────────────────────────────────

/// Persist one journal entry. A repeated envelope id is silently ignored,
/// which makes at-least-once dispatch safe. Returns the rows inserted.
pub async fn insert_journal_entry(pool: &SqlitePool, entry: &JournalEntry) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO event_journal
            (event_id, kind, campaign_id, organization_id, payload, occurred_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&entry.event_id)
    .bind(&entry.kind)
    .bind(&entry.campaign_id)
    .bind(&entry.organization_id)
    .bind(&entry.payload)
    .bind(&entry.occurred_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected)
}

/// Fetch the whole journal, oldest first.
pub async fn get_journal(pool: &SqlitePool) -> Result<Vec<JournalRecord>> {
    let rows = sqlx::query_as::<_, JournalRecord>(
        r#"
        SELECT id, event_id, kind, campaign_id, organization_id, payload,
               occurred_at, recorded_at
        FROM   event_journal
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch the journal of one campaign, oldest first.
pub async fn get_journal_for_campaign(
    pool: &SqlitePool,
    campaign_id: &str,
) -> Result<Vec<JournalRecord>> {
    let rows = sqlx::query_as::<_, JournalRecord>(
        r#"
        SELECT id, event_id, kind, campaign_id, organization_id, payload,
               occurred_at, recorded_at
        FROM   event_journal
        WHERE  campaign_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch the journal of one organization, oldest first.
pub async fn get_journal_for_organization(
    pool: &SqlitePool,
    organization_id: &str,
) -> Result<Vec<JournalRecord>> {
    let rows = sqlx::query_as::<_, JournalRecord>(
        r#"
        SELECT id, event_id, kind, campaign_id, organization_id, payload,
               occurred_at, recorded_at
        FROM   event_journal
        WHERE  organization_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Job runs
// ─────────────────────────────────────────────────────────

/// Record the latest run of a reconciliation job.
pub async fn save_job_run(pool: &SqlitePool, report: &JobReport) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_runs (job, last_run_at, affected, detail)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (job) DO UPDATE SET
            last_run_at = excluded.last_run_at,
            affected    = excluded.affected,
            detail      = excluded.detail
        "#,
    )
    .bind(report.job.as_str())
    .bind(report.ran_at.to_rfc3339())
    .bind(report.affected as i64)
    .bind(&report.detail)
    .execute(pool)
    .await?;
    Ok(())
}

/// Last run of every known job. Rows naming a job this build does not know,
/// or carrying an unreadable timestamp, are skipped with a warning.
pub async fn load_job_runs(pool: &SqlitePool) -> Result<Vec<(Job, DateTime<Utc>)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT job, last_run_at FROM job_runs")
        .fetch_all(pool)
        .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for (name, raw) in rows {
        let Some(job) = Job::parse(&name) else {
            warn!("Ignoring run of unknown job {name}");
            continue;
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => runs.push((job, at.with_timezone(&Utc))),
            Err(e) => warn!("Ignoring run of {job} with timestamp {raw:?}: {e}"),
        }
    }
    Ok(runs)
}

// ─────────────────────────────────────────────────────────
// Organization directory
// ─────────────────────────────────────────────────────────

/// Record an organization's owner and verification flag.
pub async fn save_organization(
    pool: &SqlitePool,
    organization_id: OrganizationId,
    owner: UserId,
    verified: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO organizations (id, owner_id, verified)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (id) DO UPDATE SET
            owner_id = excluded.owner_id,
            verified = excluded.verified
        "#,
    )
    .bind(organization_id.to_string())
    .bind(owner.to_string())
    .bind(verified)
    .execute(pool)
    .await?;
    Ok(())
}

/// Every known organization. Rows with unreadable ids are skipped with a
/// warning.
pub async fn load_organizations(pool: &SqlitePool) -> Result<Vec<(OrganizationId, UserId, bool)>> {
    let rows: Vec<(String, String, bool)> =
        sqlx::query_as("SELECT id, owner_id, verified FROM organizations")
            .fetch_all(pool)
            .await?;

    let mut organizations = Vec::with_capacity(rows.len());
    for (id, owner, verified) in rows {
        match (Uuid::parse_str(&id), Uuid::parse_str(&owner)) {
            (Ok(id), Ok(owner)) => {
                organizations.push((OrganizationId(id), UserId(owner), verified))
            }
            _ => warn!("Ignoring organization row {id:?} owned by {owner:?}"),
        }
    }
    Ok(organizations)
}
