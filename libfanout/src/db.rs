//! SQLite storage for runs and the event log

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, FanoutError, Result};
use crate::store::{EventLogStore, RunStore};
use crate::types::{
    EventMetadata, PostEvent, PostEventType, PostRecord, ResumeMode, RunState, RunUpdate,
};

const EVENT_COLUMNS: &str =
    "id, run_id, account_id, event_type, file_id, source_url, error, metadata, created_at";

/// Filters for [`Database::query_runs`]
#[derive(Debug, Clone)]
pub struct RunQuery {
    pub submission_id: Option<String>,
    pub state: Option<RunState>,
    /// Unix milliseconds, inclusive
    pub since: Option<i64>,
    /// Unix milliseconds, inclusive
    pub until: Option<i64>,
    pub limit: usize,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            submission_id: None,
            state: None,
            since: None,
            until: None,
            limit: 20,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) a database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Open an existing database without writing to it
    pub async fn open_read_only(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        if !Path::new(&expanded_path).exists() {
            return Err(FanoutError::NotFound(format!(
                "Database not found at {}",
                expanded_path
            )));
        }

        let db_url = format!("sqlite://{}?mode=ro", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs matching `query`, newest first
    pub async fn query_runs(&self, query: &RunQuery) -> Result<Vec<PostRecord>> {
        let mut sql = String::from(
            "SELECT id, submission_id, state, resume_mode, created_at, completed_at \
             FROM post_records WHERE 1=1",
        );
        if query.submission_id.is_some() {
            sql.push_str(" AND submission_id = ?");
        }
        if query.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if query.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if query.until.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");

        let mut builder = sqlx::query(&sql);
        if let Some(submission_id) = &query.submission_id {
            builder = builder.bind(submission_id);
        }
        if let Some(state) = query.state {
            builder = builder.bind(state.as_str());
        }
        if let Some(since) = query.since {
            builder = builder.bind(since);
        }
        if let Some(until) = query.until {
            builder = builder.bind(until);
        }
        builder = builder.bind(query.limit as i64);

        let rows = builder
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn query_events(&self, sql: &str, run_id: &str) -> Result<Vec<PostEvent>> {
        let rows = sqlx::query(sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(event_from_row).collect()
    }
}

fn decode_error(column: &str, reason: impl Into<String>) -> FanoutError {
    DbError::Decode {
        column: column.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn run_from_row(row: &SqliteRow) -> Result<PostRecord> {
    let state: String = row.get("state");
    let resume_mode: String = row.get("resume_mode");

    Ok(PostRecord {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        state: RunState::parse(&state)
            .ok_or_else(|| decode_error("state", format!("unknown state '{}'", state)))?,
        resume_mode: ResumeMode::parse(&resume_mode).ok_or_else(|| {
            decode_error("resume_mode", format!("unknown mode '{}'", resume_mode))
        })?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<PostEvent> {
    let event_type: String = row.get("event_type");
    let error: Option<String> = row.get("error");
    let metadata: Option<String> = row.get("metadata");

    let error = error
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| decode_error("error", e.to_string()))?;
    let metadata: EventMetadata = metadata
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| decode_error("metadata", e.to_string()))?
        .unwrap_or_default();

    Ok(PostEvent {
        id: row.get("id"),
        run_id: row.get("run_id"),
        account_id: row.get("account_id"),
        event_type: PostEventType::parse(&event_type).ok_or_else(|| {
            decode_error("event_type", format!("unknown event type '{}'", event_type))
        })?,
        file_id: row.get("file_id"),
        source_url: row.get("source_url"),
        error,
        metadata,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl RunStore for Database {
    async fn insert_run(&self, run: &PostRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_records (id, submission_id, state, resume_mode, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.submission_id)
        .bind(run.state.as_str())
        .bind(run.resume_mode.as_str())
        .bind(run.created_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn find_run(&self, run_id: &str) -> Result<Option<PostRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, submission_id, state, resume_mode, created_at, completed_at
            FROM post_records WHERE id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn find_runs_for_submission(&self, submission_id: &str) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, submission_id, state, resume_mode, created_at, completed_at
            FROM post_records
            WHERE submission_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE post_records
            SET state = COALESCE(?, state),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(update.state.map(|s| s.as_str()))
        .bind(update.completed_at)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(FanoutError::NotFound(format!("Run not found: {}", run_id)));
        }

        Ok(())
    }
}

#[async_trait]
impl EventLogStore for Database {
    async fn insert(&self, event: &PostEvent) -> Result<()> {
        let error = event
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| decode_error("error", e.to_string()))?;
        let metadata = if event.metadata.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&event.metadata)
                    .map_err(|e| decode_error("metadata", e.to_string()))?,
            )
        };

        sqlx::query(
            r#"
            INSERT INTO post_events
                (id, run_id, account_id, event_type, file_id, source_url, error, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.run_id)
        .bind(&event.account_id)
        .bind(event.event_type.as_str())
        .bind(&event.file_id)
        .bind(&event.source_url)
        .bind(error)
        .bind(metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn find_by_run(&self, run_id: &str) -> Result<Vec<PostEvent>> {
        let sql = format!(
            "SELECT {} FROM post_events WHERE run_id = ? ORDER BY seq ASC",
            EVENT_COLUMNS
        );
        self.query_events(&sql, run_id).await
    }

    async fn get_failed_events(&self, run_id: &str) -> Result<Vec<PostEvent>> {
        let failure_types = PostEventType::failure_types()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM post_events WHERE run_id = ? AND event_type IN ({}) ORDER BY seq ASC",
            EVENT_COLUMNS, failure_types
        );
        self.query_events(&sql, run_id).await
    }

    async fn get_source_urls_from_run(
        &self,
        run_id: &str,
        excluding_account: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT source_url FROM post_events
            WHERE run_id = ?
              AND account_id != ?
              AND source_url IS NOT NULL
              AND source_url != ''
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .bind(excluding_account)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("source_url")).collect())
    }
}
