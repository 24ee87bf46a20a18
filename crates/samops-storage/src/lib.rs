//! Durable storage for opportunity rows and the sync cursor.
//!
//! The Postgres gateway and cursor store take an explicit [`sqlx::PgPool`]
//! at construction; nothing here reads connection state from the
//! environment. [`MemoryStore`] implements the same traits with the same
//! observable semantics for tests and embedders without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use samops_core::OpportunityRow;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "samops-storage";

/// Idempotent schema bootstrap statements.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Column order for the positional fallback binding path. Both upsert
/// statements and the query projection follow this order.
pub const EXPECTED_ORDER: [&str; 13] = [
    "id",
    "title",
    "solicitation_number",
    "posted_date",
    "response_date",
    "set_aside",
    "naics",
    "org",
    "city",
    "state",
    "zip",
    "url",
    "description",
];

const UPSERT_BULK_SQL: &str = r#"
INSERT INTO opportunities (
    id, title, solicitation_number, posted_date, response_date,
    set_aside, naics, org, city, state, zip, url, description, updated_at
)
SELECT u.id, u.title, u.solicitation_number, u.posted_date, u.response_date,
       u.set_aside, u.naics, u.org, u.city, u.state, u.zip, u.url, u.description, NOW()
FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::date[], $5::date[],
    $6::text[], $7::text[], $8::text[], $9::text[], $10::text[],
    $11::text[], $12::text[], $13::text[]
) AS u(id, title, solicitation_number, posted_date, response_date,
       set_aside, naics, org, city, state, zip, url, description)
ON CONFLICT (id) DO UPDATE SET
    title               = EXCLUDED.title,
    solicitation_number = EXCLUDED.solicitation_number,
    posted_date         = EXCLUDED.posted_date,
    response_date       = EXCLUDED.response_date,
    set_aside           = EXCLUDED.set_aside,
    naics               = EXCLUDED.naics,
    org                 = EXCLUDED.org,
    city                = EXCLUDED.city,
    state               = EXCLUDED.state,
    zip                 = EXCLUDED.zip,
    url                 = EXCLUDED.url,
    description         = EXCLUDED.description,
    updated_at          = NOW()
"#;

const UPSERT_ROW_SQL: &str = r#"
INSERT INTO opportunities (
    id, title, solicitation_number, posted_date, response_date,
    set_aside, naics, org, city, state, zip, url, description, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
ON CONFLICT (id) DO UPDATE SET
    title               = EXCLUDED.title,
    solicitation_number = EXCLUDED.solicitation_number,
    posted_date         = EXCLUDED.posted_date,
    response_date       = EXCLUDED.response_date,
    set_aside           = EXCLUDED.set_aside,
    naics               = EXCLUDED.naics,
    org                 = EXCLUDED.org,
    city                = EXCLUDED.city,
    state               = EXCLUDED.state,
    zip                 = EXCLUDED.zip,
    url                 = EXCLUDED.url,
    description         = EXCLUDED.description,
    updated_at          = NOW()
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Sort orders offered by the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Soonest deadline first, then newest posting. Null deadlines sort last.
    #[default]
    DueThenPosted,
    PostedDesc,
}

/// Filter/sort/page parameters for [`OpportunityStore::query`].
#[derive(Debug, Clone)]
pub struct OppQuery {
    /// Keep rows whose deadline is today or later, or that have none.
    pub active: bool,
    /// Substring match over the naics column.
    pub naics: Option<String>,
    /// Case-insensitive substring over title and description.
    pub keyword: Option<String>,
    /// Exact ZIP match.
    pub zip: Option<String>,
    /// Substring match over the set-aside column.
    pub set_aside: Option<String>,
    pub sort: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for OppQuery {
    fn default() -> Self {
        Self {
            active: true,
            naics: None,
            keyword: None,
            zip: None,
            set_aside: None,
            sort: SortOrder::default(),
            limit: 100,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert-or-update rows keyed by `id`. Empty input is a no-op.
    /// Returns the number of rows written.
    async fn upsert_many(&self, rows: &[OpportunityRow]) -> Result<u64, StorageError>;

    async fn upsert_one(&self, row: &OpportunityRow) -> Result<u64, StorageError> {
        self.upsert_many(std::slice::from_ref(row)).await
    }

    /// Remove rows whose `response_date` is strictly in the past. Rows with
    /// no deadline are never removed. Returns the number deleted.
    async fn delete_expired(&self) -> Result<u64, StorageError>;

    async fn query(&self, query: &OppQuery) -> Result<Vec<OpportunityRow>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Last-write-wins; repeated calls with the same value are a no-op in
    /// effect (the server-side timestamp still refreshes).
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

// ----------------------------------------------------------------------
// Postgres
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they don't exist.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_bulk(&self, rows: &[OpportunityRow]) -> Result<u64, StorageError> {
        let mut ids = Vec::with_capacity(rows.len());
        let mut titles = Vec::with_capacity(rows.len());
        let mut solicitations = Vec::with_capacity(rows.len());
        let mut posted = Vec::with_capacity(rows.len());
        let mut response = Vec::with_capacity(rows.len());
        let mut set_asides = Vec::with_capacity(rows.len());
        let mut naics = Vec::with_capacity(rows.len());
        let mut orgs = Vec::with_capacity(rows.len());
        let mut cities = Vec::with_capacity(rows.len());
        let mut states = Vec::with_capacity(rows.len());
        let mut zips = Vec::with_capacity(rows.len());
        let mut urls = Vec::with_capacity(rows.len());
        let mut descriptions = Vec::with_capacity(rows.len());

        for row in rows {
            ids.push(row.id.clone());
            titles.push(row.title.clone());
            solicitations.push(row.solicitation_number.clone());
            posted.push(row.posted_date);
            response.push(row.response_date);
            set_asides.push(row.set_aside.clone());
            naics.push(row.naics.clone());
            orgs.push(row.org.clone());
            cities.push(row.city.clone());
            states.push(row.state.clone());
            zips.push(row.zip.clone());
            urls.push(row.url.clone());
            descriptions.push(row.description.clone());
        }

        let result = sqlx::query(UPSERT_BULK_SQL)
            .bind(&ids)
            .bind(&titles)
            .bind(&solicitations)
            .bind(&posted)
            .bind(&response)
            .bind(&set_asides)
            .bind(&naics)
            .bind(&orgs)
            .bind(&cities)
            .bind(&states)
            .bind(&zips)
            .bind(&urls)
            .bind(&descriptions)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Positional per-row replay inside one transaction, following
    /// [`EXPECTED_ORDER`]. Also the only path that can absorb a batch
    /// carrying the same id twice, which the single-statement form rejects.
    async fn upsert_per_row(&self, rows: &[OpportunityRow]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let result = sqlx::query(UPSERT_ROW_SQL)
                .bind(&row.id)
                .bind(&row.title)
                .bind(&row.solicitation_number)
                .bind(row.posted_date)
                .bind(row.response_date)
                .bind(&row.set_aside)
                .bind(&row.naics)
                .bind(&row.org)
                .bind(&row.city)
                .bind(&row.state)
                .bind(&row.zip)
                .bind(&row.url)
                .bind(&row.description)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

/// Whether a failed batch write should be replayed through the positional
/// per-row path. Statement/binding rejections qualify; connectivity and
/// pool failures do not — the replay would only fail the same way.
fn should_fallback(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(_) | sqlx::Error::Protocol(_))
}

fn row_from_pg(row: &PgRow) -> Result<OpportunityRow, sqlx::Error> {
    Ok(OpportunityRow {
        id: row.try_get::<Option<String>, _>("id")?.unwrap_or_default(),
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        solicitation_number: row
            .try_get::<Option<String>, _>("solicitation_number")?
            .unwrap_or_default(),
        posted_date: row.try_get("posted_date")?,
        response_date: row.try_get("response_date")?,
        set_aside: row
            .try_get::<Option<String>, _>("set_aside")?
            .unwrap_or_default(),
        naics: row.try_get::<Option<String>, _>("naics")?.unwrap_or_default(),
        org: row.try_get::<Option<String>, _>("org")?.unwrap_or_default(),
        city: row.try_get::<Option<String>, _>("city")?.unwrap_or_default(),
        state: row.try_get::<Option<String>, _>("state")?.unwrap_or_default(),
        zip: row.try_get::<Option<String>, _>("zip")?.unwrap_or_default(),
        url: row.try_get::<Option<String>, _>("url")?.unwrap_or_default(),
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert_many(&self, rows: &[OpportunityRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Rows arrive complete by construction; the one hazard left open is
        // an empty primary key from a caller that bypassed the normalizer.
        let rows: Vec<OpportunityRow> = rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.ensure_id();
                row
            })
            .collect();

        match self.upsert_bulk(&rows).await {
            Ok(written) => Ok(written),
            Err(StorageError::Database(err)) if should_fallback(&err) => {
                warn!(error = %err, rows = rows.len(), "batch upsert rejected, replaying per row");
                self.upsert_per_row(&rows).await
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_expired(&self) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM opportunities
            WHERE response_date IS NOT NULL
              AND response_date < CURRENT_DATE
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, query: &OppQuery) -> Result<Vec<OpportunityRow>, StorageError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(EXPECTED_ORDER.join(", "));
        qb.push(" FROM opportunities");

        let mut sep = " WHERE ";
        if query.active {
            qb.push(sep);
            qb.push("(response_date IS NULL OR response_date >= CURRENT_DATE)");
            sep = " AND ";
        }
        if let Some(naics) = &query.naics {
            qb.push(sep);
            qb.push("naics ILIKE ");
            qb.push_bind(format!("%{naics}%"));
            sep = " AND ";
        }
        if let Some(keyword) = &query.keyword {
            let pattern = format!("%{keyword}%");
            qb.push(sep);
            qb.push("(title ILIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR description ILIKE ");
            qb.push_bind(pattern);
            qb.push(")");
            sep = " AND ";
        }
        if let Some(zip) = &query.zip {
            qb.push(sep);
            qb.push("zip = ");
            qb.push_bind(zip.clone());
            sep = " AND ";
        }
        if let Some(set_aside) = &query.set_aside {
            qb.push(sep);
            qb.push("set_aside ILIKE ");
            qb.push_bind(format!("%{set_aside}%"));
        }

        match query.sort {
            SortOrder::DueThenPosted => {
                qb.push(" ORDER BY response_date NULLS LAST, posted_date DESC NULLS LAST");
            }
            SortOrder::PostedDesc => {
                qb.push(" ORDER BY posted_date DESC NULLS LAST");
            }
        }
        qb.push(" LIMIT ");
        qb.push_bind(query.limit);
        qb.push(" OFFSET ");
        qb.push_bind(query.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_from_pg(row)?);
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = $1 LIMIT 1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRow {
    row: OpportunityRow,
    inserted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// In-memory implementation of both stores with the Postgres-observable
/// semantics (conflict-by-id overwrite, expiration sweep, query filters).
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: HashMap<String, StoredRow>,
    meta: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(inserted_at, updated_at)` for a stored row, mostly for assertions.
    pub fn stamps(&self, id: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.lock()
            .rows
            .get(id)
            .map(|stored| (stored.inserted_at, stored.updated_at))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

fn ilike(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn due_nulls_last(a: Option<NaiveDate>, b: Option<NaiveDate>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn posted_desc_nulls_last(a: Option<NaiveDate>, b: Option<NaiveDate>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert_many(&self, rows: &[OpportunityRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut inner = self.lock();
        for row in rows {
            let mut row = row.clone();
            row.ensure_id();
            match inner.rows.get_mut(&row.id) {
                Some(stored) => {
                    stored.row = row;
                    stored.updated_at = now;
                }
                None => {
                    inner.rows.insert(
                        row.id.clone(),
                        StoredRow {
                            row,
                            inserted_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn delete_expired(&self) -> Result<u64, StorageError> {
        let today = Utc::now().date_naive();
        let mut inner = self.lock();
        let before = inner.rows.len();
        inner
            .rows
            .retain(|_, stored| match stored.row.response_date {
                Some(due) => due >= today,
                None => true,
            });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn query(&self, query: &OppQuery) -> Result<Vec<OpportunityRow>, StorageError> {
        let today = Utc::now().date_naive();
        let inner = self.lock();
        let mut rows: Vec<OpportunityRow> = inner
            .rows
            .values()
            .map(|stored| stored.row.clone())
            .filter(|row| {
                if query.active {
                    match row.response_date {
                        Some(due) if due < today => return false,
                        _ => {}
                    }
                }
                if let Some(naics) = &query.naics {
                    if !ilike(&row.naics, naics) {
                        return false;
                    }
                }
                if let Some(keyword) = &query.keyword {
                    if !ilike(&row.title, keyword) && !ilike(&row.description, keyword) {
                        return false;
                    }
                }
                if let Some(zip) = &query.zip {
                    if &row.zip != zip {
                        return false;
                    }
                }
                if let Some(set_aside) = &query.set_aside {
                    if !ilike(&row.set_aside, set_aside) {
                        return false;
                    }
                }
                true
            })
            .collect();

        match query.sort {
            SortOrder::DueThenPosted => rows.sort_by(|a, b| {
                due_nulls_last(a.response_date, b.response_date)
                    .then_with(|| posted_desc_nulls_last(a.posted_date, b.posted_date))
            }),
            SortOrder::PostedDesc => {
                rows.sort_by(|a, b| posted_desc_nulls_last(a.posted_date, b.posted_date))
            }
        }

        Ok(rows
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().meta.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().meta.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
