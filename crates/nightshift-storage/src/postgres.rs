//! Postgres-backed [`RecordStore`] plus the embedded schema migrations.
//!
//! The migrations also install the storage-side hooks: a `BEFORE` row
//! trigger stamps `quality_raw_score`, and a deferred constraint trigger
//! derives `quality_metrics` when the writing transaction commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nightshift_core::{FieldPresence, JobListing, QualityMetrics, QualityPolicy};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::consistency::{CommittedListing, RecordStore, StampedListing, StoreError};

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect and pin the description threshold used by the SQL hooks on
    /// every pooled session.
    pub async fn connect(database_url: &str, policy: &QualityPolicy) -> Result<Self, StoreError> {
        let min_len = policy.min_description_len.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let min_len = min_len.clone();
                Box::pin(async move {
                    sqlx::query("SELECT set_config('nightshift.min_description_len', $1, false)")
                        .bind(min_len)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }

    /// Storage-side recompute through the SQL function installed by the
    /// migrations.
    pub async fn refresh_in_database(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("SELECT refresh_quality_metrics($1)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const LISTING_COLUMNS: &str = "id, source_url, ref_nr, profession, salary, company_name, location, \
     start_date, telephone, email, job_description, external_link, application_link, \
     quality_raw_score, updated_at";

fn committed_from_row(row: &PgRow) -> Result<CommittedListing, sqlx::Error> {
    let raw_score: i16 = row.try_get("quality_raw_score")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let listing = JobListing {
        source_url: row.try_get("source_url")?,
        ref_nr: row.try_get("ref_nr")?,
        profession: row.try_get("profession")?,
        salary: row.try_get("salary")?,
        company_name: row.try_get("company_name")?,
        location: row.try_get("location")?,
        start_date: row.try_get("start_date")?,
        telephone: row.try_get("telephone")?,
        email: row.try_get("email")?,
        job_description: row.try_get("job_description")?,
        external_link: row.try_get("external_link")?,
        application_link: row.try_get("application_link")?,
    };
    Ok(CommittedListing::new(
        row.try_get("id")?,
        listing,
        raw_score.clamp(0, 11) as u8,
        updated_at,
    ))
}

fn metrics_from_row(row: &PgRow) -> Result<QualityMetrics, sqlx::Error> {
    let raw_score: i16 = row.try_get("raw_score")?;
    Ok(QualityMetrics {
        listing_id: row.try_get("listing_id")?,
        presence: FieldPresence {
            has_profession: row.try_get("has_profession")?,
            has_salary: row.try_get("has_salary")?,
            has_company_name: row.try_get("has_company_name")?,
            has_location: row.try_get("has_location")?,
            has_start_date: row.try_get("has_start_date")?,
            has_telephone: row.try_get("has_telephone")?,
            has_email: row.try_get("has_email")?,
            has_job_description: row.try_get("has_job_description")?,
            has_ref_nr: row.try_get("has_ref_nr")?,
            has_external_link: row.try_get("has_external_link")?,
            has_application_link: row.try_get("has_application_link")?,
        },
        raw_score: raw_score.clamp(0, 11) as u8,
        completeness_score: row.try_get("completeness_score")?,
        computed_at: row.try_get("computed_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn commit_listing(
        &self,
        stamped: &StampedListing,
    ) -> Result<CommittedListing, StoreError> {
        let l = &stamped.listing;
        let sql = format!(
            r#"
            INSERT INTO job_listings (
                source_url, ref_nr, profession, salary, company_name, location,
                start_date, telephone, email, job_description, external_link,
                application_link, quality_raw_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (source_url) DO UPDATE SET
                ref_nr = EXCLUDED.ref_nr,
                profession = EXCLUDED.profession,
                salary = EXCLUDED.salary,
                company_name = EXCLUDED.company_name,
                location = EXCLUDED.location,
                start_date = EXCLUDED.start_date,
                telephone = EXCLUDED.telephone,
                email = EXCLUDED.email,
                job_description = EXCLUDED.job_description,
                external_link = EXCLUDED.external_link,
                application_link = EXCLUDED.application_link,
                quality_raw_score = EXCLUDED.quality_raw_score
            RETURNING {LISTING_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(&l.source_url)
            .bind(&l.ref_nr)
            .bind(&l.profession)
            .bind(&l.salary)
            .bind(&l.company_name)
            .bind(&l.location)
            .bind(&l.start_date)
            .bind(&l.telephone)
            .bind(&l.email)
            .bind(&l.job_description)
            .bind(&l.external_link)
            .bind(&l.application_link)
            .bind(i16::from(stamped.raw_score))
            .fetch_one(&mut *tx)
            .await?;
        let committed = committed_from_row(&row)?;
        tx.commit().await?;
        Ok(committed)
    }

    async fn upsert_metrics(
        &self,
        committed: &CommittedListing,
        metrics: &QualityMetrics,
    ) -> Result<bool, StoreError> {
        let p = &metrics.presence;
        let result = sqlx::query(
            r#"
            INSERT INTO quality_metrics (
                listing_id, has_profession, has_salary, has_company_name, has_location,
                has_start_date, has_telephone, has_email, has_job_description, has_ref_nr,
                has_external_link, has_application_link, raw_score, completeness_score,
                computed_at
            )
            SELECT l.id, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            FROM job_listings l
            WHERE l.id = $1 AND l.updated_at = $16
            ON CONFLICT (listing_id) DO UPDATE SET
                has_profession = EXCLUDED.has_profession,
                has_salary = EXCLUDED.has_salary,
                has_company_name = EXCLUDED.has_company_name,
                has_location = EXCLUDED.has_location,
                has_start_date = EXCLUDED.has_start_date,
                has_telephone = EXCLUDED.has_telephone,
                has_email = EXCLUDED.has_email,
                has_job_description = EXCLUDED.has_job_description,
                has_ref_nr = EXCLUDED.has_ref_nr,
                has_external_link = EXCLUDED.has_external_link,
                has_application_link = EXCLUDED.has_application_link,
                raw_score = EXCLUDED.raw_score,
                completeness_score = EXCLUDED.completeness_score,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(committed.id())
        .bind(p.has_profession)
        .bind(p.has_salary)
        .bind(p.has_company_name)
        .bind(p.has_location)
        .bind(p.has_start_date)
        .bind(p.has_telephone)
        .bind(p.has_email)
        .bind(p.has_job_description)
        .bind(p.has_ref_nr)
        .bind(p.has_external_link)
        .bind(p.has_application_link)
        .bind(i16::from(metrics.raw_score))
        .bind(metrics.completeness_score)
        .bind(metrics.computed_at)
        .bind(committed.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_listings WHERE id = $1)")
                .bind(committed.id())
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::PrimaryNotVisible(committed.id()))
        }
    }

    async fn load_listing(&self, id: Uuid) -> Result<Option<CommittedListing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM job_listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(committed_from_row).transpose()?)
    }

    async fn load_metrics(&self, id: Uuid) -> Result<Option<QualityMetrics>, StoreError> {
        let row = sqlx::query("SELECT * FROM quality_metrics WHERE listing_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metrics_from_row).transpose()?)
    }

    async fn listing_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT id FROM job_listings ORDER BY updated_at, id")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }
}
