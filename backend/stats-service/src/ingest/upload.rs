//! CSV upload ingestion
//!
//! Rows are validated and published one at a time, in file order. A bad row or
//! a failed publish is logged and skipped; only an unusable header fails the
//! whole upload.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::validator::{ColumnLayout, RowRejection};
use crate::kafka::publisher::EventPublisher;
use crate::metrics;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("unreadable CSV header: {0}")]
    Csv(String),
}

/// Per-upload counters returned to the caller
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub rows: usize,
    pub published: usize,
    pub rejected: usize,
    pub publish_failed: usize,
}

#[derive(Clone)]
pub struct IngestService {
    publisher: Arc<dyn EventPublisher>,
}

impl IngestService {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    pub async fn ingest_csv(&self, data: &[u8]) -> Result<UploadSummary, IngestError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data);

        let headers = reader
            .headers()
            .map_err(|e| IngestError::Csv(e.to_string()))?
            .clone();
        let layout =
            ColumnLayout::resolve(headers.iter()).map_err(IngestError::MissingColumns)?;

        let mut summary = UploadSummary::default();

        for result in reader.byte_records() {
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Stopping upload at unreadable CSV record");
                    break;
                }
            };
            summary.rows += 1;

            let line = raw.position().map(|p| p.line()).unwrap_or_default();
            let parsed = csv::StringRecord::from_byte_record(raw)
                .map_err(|_| RowRejection::Encoding)
                .and_then(|record| layout.parse(&record));

            let event = match parsed {
                Ok(event) => event,
                Err(rejection) => {
                    warn!(line = line, reason = %rejection, "Skipping invalid row");
                    metrics::ROWS_REJECTED
                        .with_label_values(&[rejection.reason()])
                        .inc();
                    summary.rejected += 1;
                    continue;
                }
            };

            debug!(
                line = line,
                player = %event.player,
                team = %event.team,
                season = %event.season,
                "Publishing stat event"
            );

            match self.publisher.publish(&event).await {
                Ok(_) => {
                    metrics::EVENTS_PUBLISHED.inc();
                    summary.published += 1;
                }
                Err(e) => {
                    warn!(line = line, error = %e, "Failed to publish row, skipping");
                    metrics::PUBLISH_FAILURES.inc();
                    summary.publish_failed += 1;
                }
            }
        }

        info!(
            rows = summary.rows,
            published = summary.published,
            rejected = summary.rejected,
            publish_failed = summary.publish_failed,
            "Upload ingested"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::publisher::{PublishError, PublishReceipt};
    use crate::models::StatEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records published events; fails for players listed in `fail_for`.
    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<StatEvent>>,
        fail_for: Vec<String>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &StatEvent) -> Result<PublishReceipt, PublishError> {
            if self.fail_for.contains(&event.player) {
                return Err(PublishError::Kafka("broker timed out".into()));
            }
            let mut events = self.events.lock();
            events.push(event.clone());
            Ok(PublishReceipt {
                partition: 0,
                offset: events.len() as i64 - 1,
            })
        }
    }

    const HEADER: &str =
        "team,player,season,points,rebounds,assists,steals,blocks,fouls,turnovers,minutes played";

    fn csv(rows: &[&str]) -> Vec<u8> {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out.into_bytes()
    }

    #[tokio::test]
    async fn test_bad_rows_skipped_batch_continues() {
        let publisher = Arc::new(RecordingPublisher::default());
        let service = IngestService::new(publisher.clone());

        let data = csv(&[
            "LAL,James,2023,20,7,5,1,0,2,3,35.5",
            "LAL,James,2023,18,7,5,1,0,7,3,35.5",
            "LAL,,2023,18,7,5,1,0,1,3,35.5",
            "LAL,Davis,2023,30,12,2,1,3,4,1,48.1",
            "LAL,Davis,2023,30,12,2,1,3,4,1,36",
        ]);

        let summary = service.ingest_csv(&data).await.unwrap();
        assert_eq!(
            summary,
            UploadSummary {
                rows: 5,
                published: 2,
                rejected: 3,
                publish_failed: 0,
            }
        );

        let events = publisher.events.lock();
        assert_eq!(events[0].player, "James");
        assert_eq!(events[1].player, "Davis");
        assert_eq!(events[1].seconds_played, 36 * 60);
    }

    #[tokio::test]
    async fn test_publish_failure_skips_row() {
        let publisher = Arc::new(RecordingPublisher {
            fail_for: vec!["Reaves".to_string()],
            ..Default::default()
        });
        let service = IngestService::new(publisher.clone());

        let data = csv(&[
            "LAL,Reaves,2023,15,3,6,1,0,2,1,30",
            "LAL,James,2023,20,7,5,1,0,2,3,35.5",
        ]);

        let summary = service.ingest_csv(&data).await.unwrap();
        assert_eq!(summary.published, 1);
        assert_eq!(summary.publish_failed, 1);
        assert_eq!(publisher.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_header_fails_upload() {
        let service = IngestService::new(Arc::new(RecordingPublisher::default()));

        let err = service
            .ingest_csv(b"team,player,season,points\nLAL,James,2023,20")
            .await
            .unwrap_err();

        match err {
            IngestError::MissingColumns(missing) => {
                assert!(missing.contains(&"minutes played".to_string()));
                assert!(!missing.contains(&"team".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_and_non_utf8_rows_rejected() {
        let publisher = Arc::new(RecordingPublisher::default());
        let service = IngestService::new(publisher.clone());

        let mut data = csv(&["LAL,James,2023", "LAL,James,2023,20,7,5,1,0,2,3,35.5"]);
        data.extend_from_slice(b"\nLAL,\xff\xfe,2023,20,7,5,1,0,2,3,35.5");

        let summary = service.ingest_csv(&data).await.unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.published, 1);
    }
}
