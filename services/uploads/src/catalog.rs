use crate::config::DatabaseConfig;
use crate::error::StorageError;
use crate::files::File;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, instrument};

type CatalogResult<T> = Result<T, StorageError>;

/// Relational catalog of file rows and the moderation blocklist
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_file(&self, file: &File) -> CatalogResult<()>;

    async fn get_file(&self, id: &str) -> CatalogResult<Option<File>>;

    /// Flip `claimed` from false to true. Returns false when nothing changed.
    async fn claim_file(&self, id: &str) -> CatalogResult<bool>;

    /// Delete a row and count the rows still sharing its `(hash, bucket)`,
    /// as one unit. `None` when no row matched.
    async fn delete_file(&self, id: &str, only_unclaimed: bool) -> CatalogResult<Option<i64>>;

    /// Rows currently pointing at the object `(hash, bucket)`
    async fn count_references(&self, hash: &str, bucket: &str) -> CatalogResult<i64>;

    /// Unclaimed rows uploaded strictly before `cutoff`, oldest first
    async fn list_stale_unclaimed(&self, cutoff: i64, limit: i64) -> CatalogResult<Vec<File>>;

    /// Mark every row of an uploader unclaimed
    async fn unclaim_by_uploader(&self, uploaded_by: &str) -> CatalogResult<u64>;

    /// Record the resource an attachment is used by and claim it
    async fn set_used_by(&self, id: &str, resource: &str) -> CatalogResult<u64>;

    async fn clear_used_by_id(&self, id: &str) -> CatalogResult<u64>;

    async fn clear_used_by_uploader(&self, uploaded_by: &str) -> CatalogResult<u64>;

    /// `Some(auto_ban)` when the hash is blocklisted
    async fn block_status(&self, hash: &str) -> CatalogResult<Option<bool>>;

    async fn ping(&self) -> CatalogResult<()>;
}

const FILE_COLUMNS: &str = "id, hash, bucket, mime, filename, width, height, \
     upload_region, uploaded_by, uploaded_at, claimed, used_by";

/// Postgres-backed catalog
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a new catalog with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Serializes reference counting against inserts of the same object
async fn lock_object(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    hash: &str,
    bucket: &str,
) -> CatalogResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || '/' || $2))")
        .bind(bucket)
        .bind(hash)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Catalog for PgCatalog {
    #[instrument(skip(self, file), fields(id = %file.id, hash = %file.hash))]
    async fn insert_file(&self, file: &File) -> CatalogResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_object(&mut tx, &file.hash, &file.bucket).await?;

        sqlx::query(
            r#"
            INSERT INTO files (
                id, hash, bucket, mime, filename, width, height,
                upload_region, uploaded_by, uploaded_at, claimed, used_by
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12
            )
            "#,
        )
        .bind(&file.id)
        .bind(&file.hash)
        .bind(&file.bucket)
        .bind(&file.mime)
        .bind(&file.filename)
        .bind(file.width)
        .bind(file.height)
        .bind(&file.upload_region)
        .bind(&file.uploaded_by)
        .bind(file.uploaded_at)
        .bind(file.claimed)
        .bind(&file.used_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("File row inserted");
        Ok(())
    }

    async fn get_file(&self, id: &str) -> CatalogResult<Option<File>> {
        let file = sqlx::query_as::<_, File>(&format!(
            "SELECT {} FROM files WHERE id = $1",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    async fn claim_file(&self, id: &str) -> CatalogResult<bool> {
        let result = sqlx::query("UPDATE files SET claimed = TRUE WHERE id = $1 AND claimed = FALSE")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, id: &str, only_unclaimed: bool) -> CatalogResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM files
            WHERE id = $1 AND ($2 = FALSE OR claimed = FALSE)
            RETURNING hash, bucket
            "#,
        )
        .bind(id)
        .bind(only_unclaimed)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = deleted else {
            tx.rollback().await?;
            return Ok(None);
        };
        let hash: String = row.get("hash");
        let bucket: String = row.get("bucket");

        lock_object(&mut tx, &hash, &bucket).await?;

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE hash = $1 AND bucket = $2")
                .bind(&hash)
                .bind(&bucket)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        debug!(remaining = remaining, "File row deleted");
        Ok(Some(remaining))
    }

    async fn count_references(&self, hash: &str, bucket: &str) -> CatalogResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE hash = $1 AND bucket = $2")
            .bind(hash)
            .bind(bucket)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_stale_unclaimed(&self, cutoff: i64, limit: i64) -> CatalogResult<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {} FROM files \
             WHERE claimed = FALSE AND uploaded_at < $1 \
             ORDER BY uploaded_at ASC LIMIT $2",
            FILE_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    async fn unclaim_by_uploader(&self, uploaded_by: &str) -> CatalogResult<u64> {
        let result = sqlx::query("UPDATE files SET claimed = FALSE WHERE uploaded_by = $1")
            .bind(uploaded_by)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn set_used_by(&self, id: &str, resource: &str) -> CatalogResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET used_by = $2, claimed = TRUE \
             WHERE id = $1 AND bucket = 'attachments'",
        )
        .bind(id)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn clear_used_by_id(&self, id: &str) -> CatalogResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET used_by = NULL, claimed = FALSE \
             WHERE id = $1 AND bucket = 'attachments'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn clear_used_by_uploader(&self, uploaded_by: &str) -> CatalogResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET used_by = NULL, claimed = FALSE \
             WHERE uploaded_by = $1 AND bucket = 'attachments'",
        )
        .bind(uploaded_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn block_status(&self, hash: &str) -> CatalogResult<Option<bool>> {
        let auto_ban: Option<bool> =
            sqlx::query_scalar("SELECT auto_ban FROM blocked_files WHERE hash = $1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        Ok(auto_ban)
    }

    async fn ping(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
