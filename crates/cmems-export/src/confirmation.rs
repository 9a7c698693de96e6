//! Ingestion responses
//!
//! After a delivery note is uploaded the ingestion service answers,
//! eventually, with `DNT_response/<note stem>_response.xml`. The response
//! marks success with `Ingested="True"`; individual files it refused carry a
//! `FileName` and a `RejectionReason`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::remote::{RemoteLayout, RemoteStore};

/// Reason recorded when a response neither confirms nor names a file
pub const NOT_INGESTED_REASON: &str = "ingestion not confirmed by response";

#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("Malformed ingestion response '{path}': {message}")]
    Malformed { path: String, message: String },
}

/// Per-file refusal named in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub file_name: String,
    pub reason: String,
}

/// Outcome for one delivered file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileVerdict {
    Ingested,
    Rejected { reason: String },
}

/// A parsed ingestion response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfirmationArtifact {
    pub batch_ingested: bool,
    pub rejections: Vec<Rejection>,
}

impl ConfirmationArtifact {
    pub fn parse(xml: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut artifact = Self::default();
        let mut saw_element = false;
        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                    saw_element = true;
                    artifact.inspect(&element)?;
                },
                Ok(Event::Eof) => break,
                Ok(_) => {},
                Err(e) => return Err(format!("at byte {}: {}", reader.buffer_position(), e)),
            }
        }

        if !saw_element {
            return Err("no elements".to_string());
        }
        Ok(artifact)
    }

    fn inspect(&mut self, element: &BytesStart<'_>) -> Result<(), String> {
        let mut file_name = None;
        let mut reason = None;
        let mut ingested = None;

        for attr in element.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
            match attr.key.local_name().as_ref() {
                b"FileName" => file_name = Some(value),
                b"RejectionReason" => reason = Some(value),
                b"Ingested" => ingested = Some(value.eq_ignore_ascii_case("true")),
                _ => {},
            }
        }

        if ingested == Some(true) {
            self.batch_ingested = true;
        }

        if let Some(file_name) = file_name {
            if reason.is_some() || ingested == Some(false) {
                self.rejections.push(Rejection {
                    file_name,
                    reason: reason.unwrap_or_else(|| NOT_INGESTED_REASON.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Verdict for a delivered file, addressed by its dataset-relative path.
    ///
    /// A rejection entry overrides the batch-wide marker. Entries match on
    /// the full path, the bare file name, or the name without extension.
    pub fn verdict_for(&self, remote_path: &str) -> FileVerdict {
        if let Some(rejection) = self.rejections.iter().find(|r| names_match(&r.file_name, remote_path)) {
            return FileVerdict::Rejected {
                reason: rejection.reason.clone(),
            };
        }
        if self.batch_ingested {
            FileVerdict::Ingested
        } else {
            FileVerdict::Rejected {
                reason: NOT_INGESTED_REASON.to_string(),
            }
        }
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stem(path: &str) -> &str {
    let name = base_name(path);
    name.split_once('.').map_or(name, |(stem, _)| stem)
}

fn names_match(named: &str, remote_path: &str) -> bool {
    let named = named.trim();
    named == remote_path
        || base_name(named) == base_name(remote_path)
        || stem(named) == stem(remote_path)
}

/// Result of waiting for a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Received(ConfirmationArtifact),
    /// Attempt budget exhausted; the outcome of the batch is unknown
    NoResponse { attempts: u32 },
}

/// Bounded polling for the response to one delivery note
pub struct ConfirmationPoller<'a> {
    store: &'a dyn RemoteStore,
    layout: &'a RemoteLayout,
    config: PollConfig,
}

impl<'a> ConfirmationPoller<'a> {
    pub fn new(store: &'a dyn RemoteStore, layout: &'a RemoteLayout, config: PollConfig) -> Self {
        Self {
            store,
            layout,
            config,
        }
    }

    /// Sleep, fetch, repeat, up to `max_attempts` times. A failed fetch is
    /// the same as "not ready yet".
    pub async fn wait_for(&self, notification_name: &str) -> Result<PollOutcome, ConfirmationError> {
        let path = self.layout.response_path(notification_name);
        info!(response_path = %path, "Waiting for ingestion response");

        for attempt in 1..=self.config.max_attempts {
            tokio::time::sleep(self.config.interval()).await;

            match self.store.get(&path).await {
                Ok(bytes) => {
                    let body = String::from_utf8(bytes).map_err(|e| ConfirmationError::Malformed {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    debug!(attempt, response = %body, "Ingestion response received");
                    let artifact = ConfirmationArtifact::parse(&body)
                        .map_err(|message| ConfirmationError::Malformed {
                            path: path.clone(),
                            message,
                        })?;
                    return Ok(PollOutcome::Received(artifact));
                },
                Err(e) => {
                    debug!(attempt, max_attempts = self.config.max_attempts, "No response yet: {}", e);
                },
            }
        }

        warn!(
            response_path = %path,
            attempts = self.config.max_attempts,
            "No ingestion response received"
        );
        Ok(PollOutcome::NoResponse {
            attempts: self.config.max_attempts,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    const INGESTED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<delivery PushingEntity="CopernicusMarine-InSitu-Global" date="2024-01-02T03:04:05Z" product="P" Ingested="True">
  <dataset DatasetName="D">
    <file FileName="latest/20240101/A_20240101.nc" Status="Delivered"/>
  </dataset>
</delivery>"#;

    const PARTIAL: &str = r#"<delivery product="P" Ingested="True">
  <dataset DatasetName="D">
    <file FileName="latest/20240101/A_20240101.nc" RejectionReason="checksum mismatch" Status="Rejected"/>
    <file FileName="latest/20240101/B_20240101.nc" Status="Delivered"/>
  </dataset>
</delivery>"#;

    #[test]
    fn test_batch_wide_success() {
        let artifact = ConfirmationArtifact::parse(INGESTED).unwrap();
        assert!(artifact.batch_ingested);
        assert_eq!(artifact.verdict_for("latest/20240101/A_20240101.nc"), FileVerdict::Ingested);
    }

    #[test]
    fn test_rejection_overrides_batch() {
        let artifact = ConfirmationArtifact::parse(PARTIAL).unwrap();
        assert_eq!(
            artifact.verdict_for("latest/20240101/A_20240101.nc"),
            FileVerdict::Rejected {
                reason: "checksum mismatch".to_string()
            }
        );
        assert_eq!(artifact.verdict_for("latest/20240101/B_20240101.nc"), FileVerdict::Ingested);
    }

    #[test]
    fn test_rejection_by_stem() {
        let artifact = ConfirmationArtifact::parse(
            r#"<delivery><file FileName="A_20240101" RejectionReason="bad platform"/></delivery>"#,
        )
        .unwrap();
        assert!(!artifact.batch_ingested);
        assert_eq!(
            artifact.verdict_for("latest/20240101/A_20240101.nc"),
            FileVerdict::Rejected {
                reason: "bad platform".to_string()
            }
        );
    }

    #[test]
    fn test_no_marker_means_not_ingested() {
        let artifact =
            ConfirmationArtifact::parse(r#"<delivery><dataset DatasetName="D"/></delivery>"#).unwrap();
        assert_eq!(
            artifact.verdict_for("latest/20240101/A_20240101.nc"),
            FileVerdict::Rejected {
                reason: NOT_INGESTED_REASON.to_string()
            }
        );
    }

    #[test]
    fn test_ingested_false_is_a_rejection() {
        let artifact = ConfirmationArtifact::parse(
            r#"<delivery Ingested="True"><file FileName="latest/20240101/A_20240101.nc" Ingested="False"/></delivery>"#,
        )
        .unwrap();
        assert!(matches!(
            artifact.verdict_for("latest/20240101/A_20240101.nc"),
            FileVerdict::Rejected { .. }
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(ConfirmationArtifact::parse("").is_err());
        assert!(ConfirmationArtifact::parse("<delivery><dataset></delivery>").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_waits_for_response() {
        let store = MemoryRemoteStore::new();
        let layout = RemoteLayout::new("P", "D");
        store.respond_after("/P/DNT_response/P_P2024-01-02T03:04:05Z_response.xml", 3, INGESTED);

        let poller = ConfirmationPoller::new(&store, &layout, PollConfig::default());
        let started = tokio::time::Instant::now();
        let outcome = poller.wait_for("P_P2024-01-02T03:04:05Z.xml").await.unwrap();

        assert!(matches!(outcome, PollOutcome::Received(ref a) if a.batch_ingested));
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_gives_up() {
        let store = MemoryRemoteStore::new();
        let layout = RemoteLayout::new("P", "D");
        let poller = ConfirmationPoller::new(&store, &layout, PollConfig::default());

        let started = tokio::time::Instant::now();
        let outcome = poller.wait_for("P_P2024-01-02T03:04:05Z.xml").await.unwrap();
        assert_eq!(outcome, PollOutcome::NoResponse { attempts: 50 });
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_reports_garbage() {
        let store = MemoryRemoteStore::new();
        let layout = RemoteLayout::new("P", "D");
        store.seed_file("/P/DNT_response/x_response.xml", "<delivery><oops></delivery>");

        let poller = ConfirmationPoller::new(&store, &layout, PollConfig::default());
        assert!(poller.wait_for("x.xml").await.is_err());
    }
}
