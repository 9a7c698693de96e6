//! In-memory catalog backend

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    merge_registration, state, CatalogError, CatalogResult, CatalogStore, DeliverableFile,
    DeliveryStatus, ProducedFile, Transition,
};
use crate::planner::RetentionWindow;

/// Catalog held in an ordered map; iteration is by filename.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    rows: Mutex<BTreeMap<String, DeliverableFile>>,
    failing_uploads: Mutex<HashSet<String>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows directly, bypassing the transition rules
    pub fn with_rows(rows: impl IntoIterator<Item = DeliverableFile>) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().map(|r| (r.filename.clone(), r)).collect()),
            ..Self::default()
        }
    }

    /// Make recording an upload of `filename` fail as if the database were gone
    pub fn fail_upload_records_of(&self, filename: &str) {
        self.failing_uploads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(filename.to_string());
    }

    /// Copy of every row
    pub fn rows(&self) -> Vec<DeliverableFile> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeliverableFile>> {
        // Mutations replace whole rows, so a poisoned map is still consistent.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select(&self, predicate: impl Fn(&DeliverableFile) -> bool) -> Vec<DeliverableFile> {
        self.lock().values().filter(|r| predicate(r)).cloned().collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn register(&self, file: ProducedFile) -> CatalogResult<DeliverableFile> {
        let mut rows = self.lock();
        let row = merge_registration(rows.get(&file.filename), file)?;
        rows.insert(row.filename.clone(), row.clone());
        Ok(row)
    }

    async fn get(&self, filename: &str) -> CatalogResult<Option<DeliverableFile>> {
        Ok(self.lock().get(filename).cloned())
    }

    async fn list_eligible_for_delete(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>> {
        Ok(self.select(|r| window.should_delete(r)))
    }

    async fn list_eligible_for_upload(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>> {
        Ok(self.select(|r| window.may_upload(r)))
    }

    async fn list_live(&self) -> CatalogResult<Vec<DeliverableFile>> {
        Ok(self.select(|r| {
            matches!(r.status(), DeliveryStatus::Uploaded | DeliveryStatus::Confirmed)
        }))
    }

    async fn list_in_batch(&self, batch_id: &str) -> CatalogResult<Vec<DeliverableFile>> {
        Ok(self.select(|r| r.notification_batch_id.as_deref() == Some(batch_id)))
    }

    async fn transition(
        &self,
        filename: &str,
        transition: Transition,
    ) -> CatalogResult<DeliverableFile> {
        if matches!(transition, Transition::Upload { .. })
            && self
                .failing_uploads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(filename)
        {
            return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut rows = self.lock();
        let current = rows
            .get(filename)
            .ok_or_else(|| CatalogError::NotFound(filename.to_string()))?;
        let next = state::apply(current, &transition)?;
        rows.insert(filename.to_string(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::DeliveryState;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::path::PathBuf;

    fn produced(name: &str, date: NaiveDate) -> ProducedFile {
        ProducedFile {
            filename: name.to_string(),
            content_hash: "0cc175b9c0f1b6a831c399e269772661".to_string(),
            source_date: date,
            source_dataset: "LMEL".to_string(),
            local_path: PathBuf::from(format!("latest/{}", name)),
        }
    }

    fn window() -> RetentionWindow {
        RetentionWindow::new(Utc.with_ymd_and_hms(2024, 2, 15, 12, 0, 0).unwrap(), 30)
    }

    #[tokio::test]
    async fn test_register_and_transition() {
        let store = MemoryCatalogStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        store.register(produced("A_20240210.nc", date)).await.unwrap();

        let row = store
            .mark_uploaded("A_20240210.nc", "latest/20240210/A_20240210.nc", "b1")
            .await
            .unwrap();
        assert_eq!(row.status(), DeliveryStatus::Uploaded);

        // replay after a crash
        store
            .mark_uploaded("A_20240210.nc", "latest/20240210/A_20240210.nc", "b1")
            .await
            .unwrap();

        assert_eq!(store.list_in_batch("b1").await.unwrap().len(), 1);
        assert_eq!(store.list_live().await.unwrap().len(), 1);

        store.mark_confirmed("A_20240210.nc").await.unwrap();
        let row = store.get("A_20240210.nc").await.unwrap().unwrap();
        assert!(matches!(row.state, DeliveryState::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let store = MemoryCatalogStore::new();
        let err = store.mark_confirmed("missing.nc").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_eligibility_queries() {
        let store = MemoryCatalogStore::new();
        let recent = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        let old = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        store.register(produced("NEW_20240210.nc", recent)).await.unwrap();
        store.register(produced("OLD_20231201.nc", old)).await.unwrap();

        // old and never uploaded: neither deleted nor uploaded
        let uploads = store.list_eligible_for_upload(&window()).await.unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].filename, "NEW_20240210.nc");
        assert!(store.list_eligible_for_delete(&window()).await.unwrap().is_empty());

        store
            .mark_uploaded("OLD_20231201.nc", "latest/20231201/OLD_20231201.nc", "b0")
            .await
            .unwrap();
        store.mark_confirmed("OLD_20231201.nc").await.unwrap();
        let deletes = store.list_eligible_for_delete(&window()).await.unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].filename, "OLD_20231201.nc");
    }
}
