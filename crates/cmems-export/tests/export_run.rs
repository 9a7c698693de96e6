//! End-to-end export runs against the in-memory catalog and push server
#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use cmems_common::FileMetadata;
use cmems_export::catalog::{CatalogStore, DeliverableFile, DeliveryStatus, MemoryCatalogStore};
use cmems_export::config::{ExportConfig, ProductConfig};
use cmems_export::engine::{plan_from_catalog, ExportEngine, RunOutcome};
use cmems_export::producer::{register_produced, RenderedFile};
use cmems_export::remote::{MemoryRemoteStore, RemoteStore};
use tempfile::TempDir;

const RESPONSES: &str = "/P/DNT_response/";

const INGESTED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<delivery PushingEntity="CopernicusMarine-InSitu-Global" product="P" Ingested="True">
  <dataset DatasetName="D"/>
</delivery>"#;

struct Fixture {
    _dir: TempDir,
    config: ExportConfig,
    catalog: MemoryCatalogStore,
    store: MemoryRemoteStore,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            product: ProductConfig {
                product_id: "P".to_string(),
                dataset_id: "D".to_string(),
                local_folder: dir.path().join("latest"),
                ..ProductConfig::default()
            },
            ..ExportConfig::default()
        };
        Self {
            _dir: dir,
            config,
            catalog: MemoryCatalogStore::new(),
            store: MemoryRemoteStore::new(),
        }
    }

    async fn produce(&self, filename: &str, bytes: &[u8]) -> DeliverableFile {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rendered = RenderedFile {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            source_dataset: "LMEL20240101".to_string(),
            metadata: FileMetadata {
                platform_code: "LMEL".to_string(),
                lat_min: 59.5,
                lat_max: 60.25,
                lon_min: -4.75,
                lon_max: 5.0,
                time_coverage_start: start,
                time_coverage_end: start + Duration::hours(23),
                date_update: start + Duration::hours(28),
                parameters: vec!["TEMP".to_string(), "FCO2".to_string()],
                wmo_platform_code: Some("LMEL".to_string()),
                last_latitude: Some(60.25),
                last_longitude: Some(5.0),
            },
        };
        register_produced(&self.catalog, &self.config.product.local_folder, rendered)
            .await
            .unwrap()
    }

    /// A file that went through a confirmed batch in the past
    async fn produce_confirmed(&self, filename: &str, date: &str, batch_id: &str) {
        self.produce(filename, filename.as_bytes()).await;
        let remote_path = format!("latest/{}/{}", date, filename);
        self.catalog.mark_uploaded(filename, &remote_path, batch_id).await.unwrap();
        self.catalog.mark_confirmed(filename).await.unwrap();
    }

    fn engine(&self) -> ExportEngine<'_> {
        ExportEngine::new(&self.catalog, &self.store, &self.config)
    }

    async fn status(&self, filename: &str) -> DeliveryStatus {
        self.catalog.get(filename).await.unwrap().unwrap().status()
    }

    /// What the ingestion service does with delivered data once it is done
    async fn consume_data(&self) {
        for path in self.store.files() {
            if path.starts_with("/P/D/latest/") {
                self.store.remove(&path).await.unwrap();
            }
        }
    }

    fn note(&self, batch_id: &str) -> String {
        let bytes = self.store.read(&format!("/P/DNT/P_P{}.xml", batch_id)).unwrap();
        String::from_utf8(bytes).unwrap()
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap()
}

fn response_path(at: DateTime<Utc>) -> String {
    format!("{}P_P{}_response.xml", RESPONSES, at.format("%Y-%m-%dT%H:%M:%SZ"))
}

#[tokio::test(start_paused = true)]
async fn test_ingested_batch_is_confirmed() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_after(&response_path(now()), 2, INGESTED);

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.batch_id, "2024-01-02T06:00:00Z");
    assert_eq!(report.uploaded, vec!["A_20240101.nc"]);
    assert_eq!(report.confirmed, vec!["A_20240101.nc"]);

    let row = fx.catalog.get("A_20240101.nc").await.unwrap().unwrap();
    assert_eq!(row.status(), DeliveryStatus::Confirmed);
    assert_eq!(row.remote_path(), Some("latest/20240101/A_20240101.nc"));
    assert_eq!(row.notification_batch_id.as_deref(), Some("2024-01-02T06:00:00Z"));

    assert_eq!(
        fx.store.read("/P/D/latest/20240101/A_20240101.nc").unwrap(),
        b"netcdf-a"
    );
    let index = String::from_utf8(fx.store.read("/P/D/index_latest.txt").unwrap()).unwrap();
    assert!(index.contains("/P/NRT/latest/20240101/A_20240101.nc,59.5,60.25,-4.75,5,"));

    let platforms = String::from_utf8(fx.store.read("/P/D/index_platform.txt").unwrap()).unwrap();
    assert_eq!(
        platforms.lines().last().unwrap(),
        "LMEL,2024-01-01T00:00:00Z,2024-01-02T04:00:00Z,LMEL,A_XXXXXX,\
         University of Bergen Geophysical Institute,4595,TEMP FCO2,60.25,5,2024-01-01T23:00:00Z"
    );
}

#[tokio::test(start_paused = true)]
async fn test_note_names_match_catalog_paths() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.produce("B_20240101.nc", b"netcdf-b").await;
    fx.store.respond_to_all_under(RESPONSES, INGESTED);

    fx.engine().run(now()).await.unwrap();
    let note = fx.note("2024-01-02T06:00:00Z");

    for name in ["A_20240101.nc", "B_20240101.nc"] {
        let row = fx.catalog.get(name).await.unwrap().unwrap();
        let remote_path = row.remote_path().unwrap();
        assert!(note.contains(&format!(
            r#"Checksum="{}" FileName="{}" FinalStatus="Delivered""#,
            row.content_hash, remote_path
        )));
    }
    assert!(note.contains(r#"FileName="index_latest.txt" FinalStatus="Delivered""#));
    assert!(note.contains(r#"FileName="index_platform.txt" FinalStatus="Delivered""#));
    assert!(!note.contains("KeyWord"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_file_keeps_reason() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_after(
        &response_path(now()),
        0,
        r#"<delivery Ingested="True"><dataset DatasetName="D">
             <file FileName="latest/20240101/A_20240101.nc" RejectionReason="checksum mismatch"/>
           </dataset></delivery>"#,
    );

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::PartiallyRejected);
    assert_eq!(report.exit_code(), 0);
    assert!(report.confirmed.is_empty());
    let row = fx.catalog.get("A_20240101.nc").await.unwrap().unwrap();
    assert_eq!(row.status(), DeliveryStatus::Rejected);
    assert_eq!(row.rejection_reason(), Some("checksum mismatch"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_file_is_retried() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_after(
        &response_path(now()),
        0,
        r#"<delivery><file FileName="A_20240101.nc" RejectionReason="bad platform"/></delivery>"#,
    );
    fx.engine().run(now()).await.unwrap();
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::Rejected);

    fx.consume_data().await;
    let later = now() + Duration::hours(1);
    fx.store.respond_after(&response_path(later), 1, INGESTED);

    let report = fx.engine().run(later).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let row = fx.catalog.get("A_20240101.nc").await.unwrap().unwrap();
    assert_eq!(row.status(), DeliveryStatus::Confirmed);
    assert_eq!(row.rejection_reason(), None);
    assert_eq!(row.notification_batch_id.as_deref(), Some("2024-01-02T07:00:00Z"));
}

#[tokio::test(start_paused = true)]
async fn test_no_response_leaves_files_uploaded() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;

    let started = tokio::time::Instant::now();
    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(started.elapsed(), std::time::Duration::from_secs(500));
    assert_eq!(report.outcome, RunOutcome::NoResponse);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::Uploaded);

    let next = plan_from_catalog(&fx.catalog, now() + Duration::hours(1), 30)
        .await
        .unwrap();
    assert!(next.upload_set.is_empty());
    assert!(next.is_noop());
}

#[tokio::test(start_paused = true)]
async fn test_garbled_response_is_reported() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_after(&response_path(now()), 0, "<delivery><dataset></delivery>");

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::NoResponse);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::Uploaded);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_catalog_is_a_noop() {
    let fx = Fixture::new();
    let report = fx.engine().run(now()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::NoOp);
    assert_eq!(fx.store.operations(), 0);

    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_to_all_under(RESPONSES, INGESTED);
    fx.engine().run(now()).await.unwrap();
    fx.consume_data().await;

    let before = fx.store.operations();
    let report = fx.engine().run(now() + Duration::hours(1)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::NoOp);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(fx.store.operations(), before);

    // same bytes rendered again change nothing
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::Confirmed);
    let report = fx.engine().run(now() + Duration::hours(2)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::NoOp);
}

#[tokio::test(start_paused = true)]
async fn test_expired_files_are_withdrawn() {
    let fx = Fixture::new();
    fx.produce_confirmed("OLD_20231101.nc", "20231101", "2023-11-02T06:00:00Z").await;
    fx.produce_confirmed("KEEP_20231220.nc", "20231220", "2023-12-21T06:00:00Z").await;
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.respond_to_all_under(RESPONSES, INGESTED);

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.errors.is_empty(), "{}", report.errors);
    assert_eq!(report.withdrawn, vec!["OLD_20231101.nc"]);

    let old = fx.catalog.get("OLD_20231101.nc").await.unwrap().unwrap();
    assert_eq!(old.status(), DeliveryStatus::NotUploaded);
    assert_eq!(old.notification_batch_id.as_deref(), Some("2024-01-02T06:00:00Z"));
    assert_eq!(fx.status("KEEP_20231220.nc").await, DeliveryStatus::Confirmed);

    let note = fx.note("2024-01-02T06:00:00Z");
    assert!(note.contains(
        r#"<file FileName="latest/20231101/OLD_20231101.nc"><KeyWord>Delete</KeyWord></file>"#
    ));

    let index = String::from_utf8(fx.store.read("/P/D/index_latest.txt").unwrap()).unwrap();
    assert!(index.contains("KEEP_20231220.nc"));
    assert!(index.contains("A_20240101.nc"));
    assert!(!index.contains("OLD_20231101.nc"));

    // the emptied date folder is removed with a second note
    let cleanup: Vec<String> = fx
        .store
        .files()
        .into_iter()
        .filter(|p| p.starts_with("/P/DNT/") && !p.ends_with("P_P2024-01-02T06:00:00Z.xml"))
        .collect();
    assert_eq!(cleanup.len(), 1);
    let cleanup = String::from_utf8(fx.store.read(&cleanup[0]).unwrap()).unwrap();
    assert!(cleanup.contains(
        r#"<directory DestinationFolderName="" SourceFolderName="latest/20231101"><KeyWord>Delete</KeyWord></directory>"#
    ));
    assert!(!cleanup.contains("20231220"));

    // withdrawn files are never planned again
    fx.consume_data().await;
    let next = plan_from_catalog(&fx.catalog, now() + Duration::days(1), 30)
        .await
        .unwrap();
    assert!(next.is_noop());
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_delete_stays_confirmed() {
    let fx = Fixture::new();
    fx.produce_confirmed("OLD_20231101.nc", "20231101", "2023-11-02T06:00:00Z").await;
    fx.store.respond_after(
        &response_path(now()),
        0,
        r#"<delivery><file FileName="latest/20231101/OLD_20231101.nc" RejectionReason="unknown file"/></delivery>"#,
    );

    let report = fx.engine().run(now()).await.unwrap();

    assert!(report.withdrawn.is_empty());
    assert_eq!(report.exit_code(), 3);
    assert_eq!(fx.status("OLD_20231101.nc").await, DeliveryStatus::Confirmed);

    let next = plan_from_catalog(&fx.catalog, now() + Duration::days(1), 30)
        .await
        .unwrap();
    assert_eq!(next.delete_set.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_metadata_rolls_back() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    let b = fx.produce("B_20240102.nc", b"netcdf-b").await;
    std::fs::remove_file(FileMetadata::sidecar_path(&b.local_path)).unwrap();

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.rolled_back, vec!["A_20240101.nc", "B_20240102.nc"]);
    assert!(report.orphaned.is_empty());
    assert!(report.uploaded.is_empty());

    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
    assert_eq!(fx.status("B_20240102.nc").await, DeliveryStatus::NotUploaded);
    assert!(fx.store.files().is_empty());
    assert_eq!(fx.store.dirs(), vec!["/", "/P", "/P/D", "/P/D/latest"]);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_is_left_in_place() {
    let fx = Fixture::new();
    let a = fx.produce("A_20240101.nc", b"netcdf-a").await;
    std::fs::remove_file(FileMetadata::sidecar_path(&a.local_path)).unwrap();
    fx.store.fail_removals_of("A_20240101.nc");

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.orphaned, vec!["/P/D/latest/20240101/A_20240101.nc"]);
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
    assert!(fx.store.contains("/P/D/latest/20240101/A_20240101.nc"));

    // the next run sees the orphan and refuses
    let report = fx.engine().run(now() + Duration::hours(1)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Refused);
}

#[tokio::test(start_paused = true)]
async fn test_unrecorded_retry_is_not_rolled_back() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.catalog
        .mark_uploaded("A_20240101.nc", "latest/20240101/A_20240101.nc", "2024-01-01T06:00:00Z")
        .await
        .unwrap();
    fx.catalog.mark_rejected("A_20240101.nc", "bad platform").await.unwrap();
    fx.catalog.fail_upload_records_of("A_20240101.nc");

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(report.rolled_back.is_empty());
    assert!(report.orphaned.is_empty());
    assert!(
        !report.errors.iter().any(|e| e.contains("rollback failed")),
        "{}",
        report.errors
    );
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::Rejected);
    assert!(!fx.store.contains("/P/D/latest/20240101/A_20240101.nc"));
}

#[tokio::test(start_paused = true)]
async fn test_existing_note_is_a_conflict() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.seed_file("/P/DNT/P_P2024-01-02T06:00:00Z.xml", "<delivery/>");

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(report.errors.iter().any(|e| e.contains("already exists")));
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
    assert!(!fx.store.contains("/P/D/latest/20240101/A_20240101.nc"));
    assert!(!fx.store.contains("/P/D/index_latest.txt"));
    assert!(!fx.store.contains("/P/D/index_platform.txt"));
    assert_eq!(
        fx.store.read("/P/DNT/P_P2024-01-02T06:00:00Z.xml").unwrap(),
        b"<delivery/>"
    );
}

#[tokio::test(start_paused = true)]
async fn test_stranded_file_refuses_run() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.seed_file("/P/D/latest/20231231/X_20231231.nc", "left over");
    fx.store.seed_file("/P/D/latest/20231230/.keep", "");
    fx.store.remove("/P/D/latest/20231230/.keep").await.unwrap();

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Refused);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
    assert!(!fx.store.contains("/P/D/latest/20240101/A_20240101.nc"));
    // empty folders are still swept
    assert!(!fx.store.dirs().contains(&"/P/D/latest/20231230".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_does_not_stop_batch() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.produce("B_20240101.nc", b"netcdf-b").await;
    fx.store.fail_uploads_of("B_20240101.nc");
    fx.store.respond_to_all_under(RESPONSES, INGESTED);

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.confirmed, vec!["A_20240101.nc"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(fx.status("B_20240101.nc").await, DeliveryStatus::NotUploaded);
    assert!(!fx.note("2024-01-02T06:00:00Z").contains("B_20240101.nc"));
}

#[tokio::test(start_paused = true)]
async fn test_drifted_local_file_is_not_sent() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    let b = fx.produce("B_20240101.nc", b"netcdf-b").await;
    std::fs::write(&b.local_path, b"tampered").unwrap();
    fx.store.respond_to_all_under(RESPONSES, INGESTED);

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.uploaded, vec!["A_20240101.nc"]);
    assert!(report.errors.iter().any(|e| e.starts_with("B_20240101.nc:")));
    assert!(!fx.store.contains("/P/D/latest/20240101/B_20240101.nc"));
    assert_eq!(fx.status("B_20240101.nc").await, DeliveryStatus::NotUploaded);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_deliverable_aborts() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.fail_uploads_of("A_20240101.nc");

    let report = fx.engine().run(now()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(fx.store.files().is_empty());
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
}

#[tokio::test]
async fn test_unreachable_server_is_fatal() {
    let fx = Fixture::new();
    fx.produce("A_20240101.nc", b"netcdf-a").await;
    fx.store.set_unreachable(true);

    assert!(fx.engine().run(now()).await.is_err());
    assert_eq!(fx.status("A_20240101.nc").await, DeliveryStatus::NotUploaded);
}

#[tokio::test]
async fn test_source_dates_outside_window_are_not_uploaded() {
    let fx = Fixture::new();
    fx.produce("A_20231101.nc", b"late render").await;

    let batch = plan_from_catalog(&fx.catalog, now(), 30).await.unwrap();
    assert!(batch.is_noop());
    assert_eq!(
        fx.catalog.get("A_20231101.nc").await.unwrap().unwrap().source_date,
        NaiveDate::from_ymd_opt(2023, 11, 1).unwrap()
    );
}
