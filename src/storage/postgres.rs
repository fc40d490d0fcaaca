// src/storage/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::retry::{with_retry, RetryConfig};
use crate::storage::{
    ActivityLog, ActivityRecord, Caller, CallerRegistry, Credential, DailyUsageRow, NewCaller,
    TopCallerRow,
};

/// Connect the primary pool (and the read pool when a replica is
/// configured) and run migrations.
///
/// Runtime queries keep the build free of a DATABASE_URL dependency;
/// row extraction goes through `Row::get`.
pub async fn connect(config: &DatabaseConfig) -> Result<(PgPool, PgPool)> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| crate::error::ApiError::Config(format!("DATABASE_URL: {}", e)))?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| crate::error::ApiError::Config(format!("migrations: {}", e)))?;

    let read_pool = match &config.read_url {
        Some(url) => {
            let options = PgConnectOptions::from_str(url)
                .map_err(|e| crate::error::ApiError::Config(format!("DATABASE_READ_URL: {}", e)))?;
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        }
        None => pool.clone(),
    };

    Ok((pool, read_pool))
}

/// Append-only activity log on PostgreSQL
pub struct PgActivityLog {
    pool: PgPool,
    read_pool: PgPool,
    retry: RetryConfig,
}

impl fmt::Debug for PgActivityLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgActivityLog").finish_non_exhaustive()
    }
}

impl PgActivityLog {
    pub fn new(pool: PgPool, read_pool: PgPool) -> Self {
        Self {
            pool,
            read_pool,
            retry: RetryConfig::default(),
        }
    }
}

#[async_trait]
impl ActivityLog for PgActivityLog {
    async fn bulk_insert(&self, records: &[ActivityRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        with_retry("activity_bulk_insert", &self.retry, || async {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO activity_logs \
                 (caller_id, credential_id, endpoint, method, status, elapsed_ms, ip, user_agent, timestamp) ",
            );
            builder.push_values(records.iter(), |mut row, record| {
                row.push_bind(&record.caller_id)
                    .push_bind(record.credential_id)
                    .push_bind(&record.endpoint)
                    .push_bind(&record.method)
                    .push_bind(record.status)
                    .push_bind(record.elapsed_ms)
                    .push_bind(&record.ip)
                    .push_bind(&record.user_agent)
                    .push_bind(record.timestamp);
            });

            builder.build().execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn daily_usage(&self, caller_id: &str, days: u32) -> Result<Vec<DailyUsageRow>> {
        with_retry("activity_daily_usage", &self.retry, || async {
            let rows = sqlx::query(
                "SELECT date_trunc('day', timestamp)::date AS day, \
                        COUNT(*) AS count, \
                        COALESCE(AVG(elapsed_ms), 0)::float8 AS avg_elapsed, \
                        COUNT(*) FILTER (WHERE status >= 400) AS errors \
                 FROM activity_logs \
                 WHERE caller_id = $1 AND timestamp >= now() - make_interval(days => $2) \
                 GROUP BY day \
                 ORDER BY day DESC",
            )
            .bind(caller_id)
            .bind(days as i32)
            .fetch_all(&self.read_pool)
            .await?;

            let mut usage = Vec::with_capacity(rows.len());
            for row in rows {
                usage.push(DailyUsageRow {
                    date: row.get::<NaiveDate, _>("day"),
                    count: row.get("count"),
                    avg_elapsed: row.get("avg_elapsed"),
                    errors: row.get("errors"),
                });
            }
            Ok(usage)
        })
        .await
    }

    async fn top_callers(&self, limit: u32, hours: u32) -> Result<Vec<TopCallerRow>> {
        with_retry("activity_top_callers", &self.retry, || async {
            let rows = sqlx::query(
                "SELECT caller_id, \
                        COUNT(*) AS count, \
                        COALESCE(AVG(elapsed_ms), 0)::float8 AS avg_elapsed, \
                        COUNT(*) FILTER (WHERE status >= 400) AS errors, \
                        MAX(timestamp) AS last_access \
                 FROM activity_logs \
                 WHERE timestamp >= now() - make_interval(hours => $1) \
                 GROUP BY caller_id \
                 ORDER BY count DESC \
                 LIMIT $2",
            )
            .bind(hours as i32)
            .bind(limit as i64)
            .fetch_all(&self.read_pool)
            .await?;

            let mut top = Vec::with_capacity(rows.len());
            for row in rows {
                top.push(TopCallerRow {
                    caller_id: row.get("caller_id"),
                    count: row.get("count"),
                    avg_elapsed: row.get("avg_elapsed"),
                    errors: row.get("errors"),
                    last_access: row.get::<DateTime<Utc>, _>("last_access"),
                });
            }
            Ok(top)
        })
        .await
    }

    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        with_retry("activity_retention_delete", &self.retry, || async {
            let result = sqlx::query(
                "DELETE FROM activity_logs WHERE timestamp < now() - make_interval(days => $1)",
            )
            .bind(days as i32)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

/// Caller identity and credential store on PostgreSQL
pub struct PgCallerRegistry {
    pool: PgPool,
    read_pool: PgPool,
    retry: RetryConfig,
}

impl fmt::Debug for PgCallerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgCallerRegistry").finish_non_exhaustive()
    }
}

impl PgCallerRegistry {
    pub fn new(pool: PgPool, read_pool: PgPool) -> Self {
        Self {
            pool,
            read_pool,
            retry: RetryConfig::default(),
        }
    }
}

fn caller_from_row(row: &sqlx::postgres::PgRow) -> Caller {
    Caller {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        is_active: row.get("is_active"),
        rate_limit: row.get("rate_limit"),
        created_at: row.get("created_at"),
        last_seen_at: row.get("last_seen_at"),
    }
}

#[async_trait]
impl CallerRegistry for PgCallerRegistry {
    async fn create(&self, caller: NewCaller) -> Result<Caller> {
        // Registration is not retried: a duplicate email must surface as
        // Conflict on the first round trip.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO callers (id, name, email, rate_limit) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, name, email, is_active, rate_limit, created_at, last_seen_at",
        )
        .bind(&caller.id)
        .bind(&caller.name)
        .bind(&caller.email)
        .bind(caller.rate_limit)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO credentials (id, caller_id, key_digest, key_hash, key_enc) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(caller.credential_id)
        .bind(&caller.id)
        .bind(&caller.key_digest)
        .bind(&caller.key_hash)
        .bind(&caller.key_enc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(caller_from_row(&row))
    }

    async fn find_by_id(&self, caller_id: &str) -> Result<Option<Caller>> {
        with_retry("caller_find_by_id", &self.retry, || async {
            let row = sqlx::query(
                "SELECT id, name, email, is_active, rate_limit, created_at, last_seen_at \
                 FROM callers WHERE id = $1",
            )
            .bind(caller_id)
            .fetch_optional(&self.read_pool)
            .await?;

            Ok(row.as_ref().map(caller_from_row))
        })
        .await
    }

    async fn find_by_key_digest(&self, digest: &str) -> Result<Option<(Caller, Credential)>> {
        with_retry("caller_find_by_key_digest", &self.retry, || async {
            let row = sqlx::query(
                "SELECT c.id, c.name, c.email, c.is_active, c.rate_limit, c.created_at, \
                        c.last_seen_at, \
                        k.id AS credential_id, k.key_hash, k.key_enc, \
                        k.created_at AS credential_created_at \
                 FROM credentials k \
                 JOIN callers c ON c.id = k.caller_id \
                 WHERE k.key_digest = $1",
            )
            .bind(digest)
            .fetch_optional(&self.read_pool)
            .await?;

            Ok(row.map(|row| {
                let caller = caller_from_row(&row);
                let credential = Credential {
                    id: row.get::<Uuid, _>("credential_id"),
                    caller_id: caller.id.clone(),
                    key_hash: row.get("key_hash"),
                    key_enc: row.get("key_enc"),
                    created_at: row.get("credential_created_at"),
                };
                (caller, credential)
            }))
        })
        .await
    }

    async fn touch_last_seen(&self, caller_id: &str) -> Result<()> {
        sqlx::query("UPDATE callers SET last_seen_at = now() WHERE id = $1")
            .bind(caller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Caller>> {
        with_retry("caller_list_active", &self.retry, || async {
            let rows = sqlx::query(
                "SELECT id, name, email, is_active, rate_limit, created_at, last_seen_at \
                 FROM callers WHERE is_active ORDER BY created_at",
            )
            .fetch_all(&self.read_pool)
            .await?;

            Ok(rows.iter().map(caller_from_row).collect())
        })
        .await
    }
}
