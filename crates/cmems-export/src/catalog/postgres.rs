//! PostgreSQL catalog backend
//!
//! Each mutation runs in its own transaction and locks the row with
//! `SELECT ... FOR UPDATE` before deciding the transition, so two writers
//! cannot interleave on one file.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::path::PathBuf;
use std::time::Duration;

use super::{
    merge_registration, state, CatalogError, CatalogResult, CatalogStore, DeliverableFile,
    DeliveryState, DeliveryStatus, ProducedFile, Transition,
};
use crate::config::DbConfig;
use crate::planner::RetentionWindow;

const SELECT_COLUMNS: &str = r#"
    SELECT filename, content_hash, source_date, source_dataset, local_path,
           delivery_state, remote_path, notification_batch_id, rejection_reason
    FROM deliverable_files
"#;

#[derive(Debug, sqlx::FromRow)]
struct CatalogRow {
    filename: String,
    content_hash: String,
    source_date: NaiveDate,
    source_dataset: String,
    local_path: String,
    delivery_state: String,
    remote_path: Option<String>,
    notification_batch_id: Option<String>,
    rejection_reason: Option<String>,
}

impl TryFrom<CatalogRow> for DeliverableFile {
    type Error = CatalogError;

    fn try_from(row: CatalogRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| CatalogError::Corrupt {
            filename: row.filename.clone(),
            reason,
        };
        let status: DeliveryStatus = row.delivery_state.parse().map_err(corrupt)?;
        let state = DeliveryState::from_columns(status, row.remote_path.clone(), row.rejection_reason.clone())
            .map_err(corrupt)?;

        Ok(DeliverableFile {
            filename: row.filename,
            content_hash: row.content_hash,
            source_date: row.source_date,
            source_dataset: row.source_dataset,
            local_path: PathBuf::from(row.local_path),
            state,
            notification_batch_id: row.notification_batch_id,
        })
    }
}

/// Create a connection pool for the catalog database
pub async fn create_pool(config: &DbConfig) -> CatalogResult<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Catalog connection pool created"
    );

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(config: &DbConfig) -> CatalogResult<Self> {
        let store = Self::new(create_pool(config).await?);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> CatalogResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_all(&self, clause: &str, bind: Option<&str>) -> CatalogResult<Vec<DeliverableFile>> {
        let sql = format!("{SELECT_COLUMNS} {clause} ORDER BY filename");
        let mut query = sqlx::query_as::<_, CatalogRow>(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DeliverableFile::try_from)
            .collect()
    }

    async fn fetch_by_date(&self, clause: &str, date: NaiveDate) -> CatalogResult<Vec<DeliverableFile>> {
        let sql = format!("{SELECT_COLUMNS} {clause} ORDER BY filename");
        sqlx::query_as::<_, CatalogRow>(&sql)
            .bind(date)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DeliverableFile::try_from)
            .collect()
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        filename: &str,
    ) -> CatalogResult<Option<DeliverableFile>> {
        let sql = format!("{SELECT_COLUMNS} WHERE filename = $1 FOR UPDATE");
        sqlx::query_as::<_, CatalogRow>(&sql)
            .bind(filename)
            .fetch_optional(&mut **tx)
            .await?
            .map(DeliverableFile::try_from)
            .transpose()
    }

    async fn write_row(
        tx: &mut Transaction<'_, Postgres>,
        row: &DeliverableFile,
    ) -> CatalogResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deliverable_files
                (filename, content_hash, source_date, source_dataset, local_path,
                 delivery_state, remote_path, notification_batch_id, rejection_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (filename) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                source_date = EXCLUDED.source_date,
                source_dataset = EXCLUDED.source_dataset,
                local_path = EXCLUDED.local_path,
                delivery_state = EXCLUDED.delivery_state,
                remote_path = EXCLUDED.remote_path,
                notification_batch_id = EXCLUDED.notification_batch_id,
                rejection_reason = EXCLUDED.rejection_reason,
                updated_at = NOW()
            "#,
        )
        .bind(&row.filename)
        .bind(&row.content_hash)
        .bind(row.source_date)
        .bind(&row.source_dataset)
        .bind(row.local_path.to_string_lossy().as_ref())
        .bind(row.status().as_str())
        .bind(row.remote_path())
        .bind(row.notification_batch_id.as_deref())
        .bind(row.rejection_reason())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn register(&self, file: ProducedFile) -> CatalogResult<DeliverableFile> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::lock_row(&mut tx, &file.filename).await?;
        let row = merge_registration(existing.as_ref(), file)?;
        if existing.as_ref() != Some(&row) {
            Self::write_row(&mut tx, &row).await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn get(&self, filename: &str) -> CatalogResult<Option<DeliverableFile>> {
        let sql = format!("{SELECT_COLUMNS} WHERE filename = $1");
        sqlx::query_as::<_, CatalogRow>(&sql)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?
            .map(DeliverableFile::try_from)
            .transpose()
    }

    async fn list_eligible_for_delete(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>> {
        self.fetch_by_date("WHERE delivery_state = 'confirmed' AND source_date < $1", window.cutoff())
            .await
    }

    async fn list_eligible_for_upload(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>> {
        self.fetch_by_date(
            "WHERE delivery_state IN ('not_uploaded', 'rejected') AND source_date >= $1",
            window.cutoff(),
        )
        .await
    }

    async fn list_live(&self) -> CatalogResult<Vec<DeliverableFile>> {
        self.fetch_all("WHERE delivery_state IN ('uploaded', 'confirmed')", None).await
    }

    async fn list_in_batch(&self, batch_id: &str) -> CatalogResult<Vec<DeliverableFile>> {
        self.fetch_all("WHERE notification_batch_id = $1", Some(batch_id)).await
    }

    async fn transition(
        &self,
        filename: &str,
        transition: Transition,
    ) -> CatalogResult<DeliverableFile> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_row(&mut tx, filename)
            .await?
            .ok_or_else(|| CatalogError::NotFound(filename.to_string()))?;
        let next = state::apply(&current, &transition)?;
        if next != current {
            Self::write_row(&mut tx, &next).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            %filename,
            transition = transition.name(),
            state = %next.status(),
            "Catalog row updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn produced(name: &str, date: NaiveDate) -> ProducedFile {
        ProducedFile {
            filename: name.to_string(),
            content_hash: "900150983cd24fb0d6963f7d28e17f72".to_string(),
            source_date: date,
            source_dataset: "LMEL".to_string(),
            local_path: PathBuf::from(format!("latest/{}", name)),
        }
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let row = CatalogRow {
            filename: "A_20240101.nc".to_string(),
            content_hash: "aa".to_string(),
            source_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            source_dataset: "LMEL".to_string(),
            local_path: "latest/A_20240101.nc".to_string(),
            delivery_state: "confirmed".to_string(),
            remote_path: None,
            notification_batch_id: None,
            rejection_reason: None,
        };
        let err = DeliverableFile::try_from(row).unwrap_err();
        assert!(matches!(err, CatalogError::Corrupt { .. }));
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a disposable Postgres
    async fn test_pg_catalog_lifecycle(pool: PgPool) {
        let store = PgCatalogStore::new(pool);
        let date = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        store.register(produced("A_20240210.nc", date)).await.unwrap();

        let window = RetentionWindow::new(Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap(), 30);
        assert_eq!(store.list_eligible_for_upload(&window).await.unwrap().len(), 1);

        store
            .mark_uploaded("A_20240210.nc", "latest/20240210/A_20240210.nc", "b1")
            .await
            .unwrap();
        store
            .mark_uploaded("A_20240210.nc", "latest/20240210/A_20240210.nc", "b1")
            .await
            .unwrap();
        assert!(store.list_eligible_for_upload(&window).await.unwrap().is_empty());
        assert_eq!(store.list_in_batch("b1").await.unwrap().len(), 1);

        store.mark_rejected("A_20240210.nc", "checksum mismatch").await.unwrap();
        let row = store.get("A_20240210.nc").await.unwrap().unwrap();
        assert_eq!(row.rejection_reason(), Some("checksum mismatch"));
        assert_eq!(row.remote_path(), Some("latest/20240210/A_20240210.nc"));

        let err = store.mark_confirmed("A_20240210.nc").await.unwrap_err();
        assert!(matches!(err, CatalogError::IllegalTransition { .. }));
    }
}
