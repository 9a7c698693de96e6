//! CMEMS Export Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Delivers rendered data files to the Copernicus Marine in-situ push server
//! and keeps a durable catalog of what the ingestion service has accepted.
//!
//! # Overview
//!
//! - [`catalog`]: per-file delivery state and its transition rules
//! - [`planner`]: which files a run uploads and which it withdraws
//! - [`transfer`]: upload decisions against a [`remote::RemoteStore`]
//! - [`manifest`]: `index_latest.txt` and the delivery note (DNT)
//! - [`confirmation`]: polling and parsing the ingestion response
//! - [`reconciler`]: applying verdicts, rollback of aborted batches
//! - [`engine`]: one run from plan to folder cleanup
//!
//! # Example
//!
//! ```no_run
//! use cmems_export::catalog::PgCatalogStore;
//! use cmems_export::config::ExportConfig;
//! use cmems_export::engine::ExportEngine;
//! use cmems_export::remote::FtpRemoteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ExportConfig::load()?;
//!     let catalog = PgCatalogStore::connect(&config.database).await?;
//!     let store = FtpRemoteStore::connect(&config.ftp).await?;
//!
//!     let report = ExportEngine::new(&catalog, &store, &config)
//!         .run(chrono::Utc::now())
//!         .await?;
//!     println!("{}", report.outcome);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod confirmation;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod planner;
pub mod producer;
pub mod reconciler;
pub mod remote;
pub mod transfer;

pub use engine::{ExportEngine, RunOutcome, RunReport};
pub use error::{BatchErrors, ExportError, ExportResult};
