//! Meeting record updates.
//!
//! Both updates go to `PUT {base}/meetings`. The session spawns them and never
//! waits on the outcome; failures are logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, instrument, warn};

/// Written by the host when the meeting ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub id: String,
    pub status: String,
    pub actual_duration_minutes: u64,
    pub end_time: DateTime<Utc>,
}

impl CompletionRecord {
    /// Completed-meeting record; partial minutes round up.
    #[must_use]
    pub fn completed(id: &str, elapsed_seconds: u64, end_time: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            status: "completed".to_string(),
            actual_duration_minutes: elapsed_seconds.div_ceil(60),
            end_time,
        }
    }
}

/// Written by the host after an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationUpdate {
    pub id: String,
    pub duration_minutes: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Meeting record service unavailable: {0}")]
    Unavailable(String),

    #[error("Meeting record rejected with status {0}")]
    Rejected(u16),
}

/// External meeting-record store.
#[async_trait]
pub trait MeetingRecords: Send + Sync {
    async fn complete(&self, record: &CompletionRecord) -> Result<(), RecordError>;

    async fn update_duration(&self, update: &DurationUpdate) -> Result<(), RecordError>;
}

/// Meeting-record client over HTTP.
#[derive(Clone, Debug)]
pub struct HttpMeetingRecords {
    client: Client,
    base_url: String,
}

impl HttpMeetingRecords {
    /// # Errors
    ///
    /// Returns `RecordError::Unavailable` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RecordError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "call.records", error = %e, "Failed to build HTTP client");
                RecordError::Unavailable("HTTP client unavailable".to_string())
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn put<T: Serialize + Sync>(&self, body: &T) -> Result<(), RecordError> {
        let response = self
            .client
            .put(format!("{}/meetings", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "call.records", error = %e, "Meeting record request failed");
                RecordError::Unavailable("Meeting record service is unavailable".to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            warn!(target: "call.records", status = %status, "Meeting record service error");
            Err(RecordError::Unavailable(format!("status {status}")))
        } else {
            warn!(target: "call.records", status = %status, "Meeting record rejected");
            Err(RecordError::Rejected(status.as_u16()))
        }
    }
}

#[async_trait]
impl MeetingRecords for HttpMeetingRecords {
    #[instrument(skip_all, fields(meeting_id = %record.id))]
    async fn complete(&self, record: &CompletionRecord) -> Result<(), RecordError> {
        self.put(record).await
    }

    #[instrument(skip_all, fields(meeting_id = %update.id, duration_minutes = update.duration_minutes))]
    async fn update_duration(&self, update: &DurationUpdate) -> Result<(), RecordError> {
        self.put(update).await
    }
}

/// Recording mock for session tests.
pub mod mock {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    #[derive(Default)]
    pub struct MockMeetingRecords {
        completions: Mutex<Vec<CompletionRecord>>,
        duration_updates: Mutex<Vec<DurationUpdate>>,
    }

    impl MockMeetingRecords {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn completions(&self) -> Vec<CompletionRecord> {
            self.completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn duration_updates(&self) -> Vec<DurationUpdate> {
            self.duration_updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl MeetingRecords for MockMeetingRecords {
        async fn complete(&self, record: &CompletionRecord) -> Result<(), RecordError> {
            self.completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone());
            Ok(())
        }

        async fn update_duration(&self, update: &DurationUpdate) -> Result<(), RecordError> {
            self.duration_updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(update.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_completed_rounds_minutes_up() {
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(
            CompletionRecord::completed("m", 0, end).actual_duration_minutes,
            0
        );
        assert_eq!(
            CompletionRecord::completed("m", 61, end).actual_duration_minutes,
            2
        );
        assert_eq!(
            CompletionRecord::completed("m", 120, end).actual_duration_minutes,
            2
        );
    }

    #[tokio::test]
    async fn test_complete_puts_record() {
        let mock_server = MockServer::start().await;
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();

        Mock::given(method("PUT"))
            .and(path("/meetings"))
            .and(body_json(serde_json::json!({
                "id": "mtg-1",
                "status": "completed",
                "actualDurationMinutes": 15,
                "endTime": "2024-05-01T10:30:00Z"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let records = HttpMeetingRecords::new(mock_server.uri(), Duration::from_secs(2)).unwrap();
        records
            .complete(&CompletionRecord::completed("mtg-1", 900, end))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_duration_puts_minutes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/meetings"))
            .and(body_json(serde_json::json!({"id": "mtg-1", "durationMinutes": 45})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let records = HttpMeetingRecords::new(mock_server.uri(), Duration::from_secs(2)).unwrap();
        records
            .update_duration(&DurationUpdate {
                id: "mtg-1".to_string(),
                duration_minutes: 45,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/meetings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let records = HttpMeetingRecords::new(mock_server.uri(), Duration::from_secs(2)).unwrap();
        let result = records
            .update_duration(&DurationUpdate {
                id: "mtg-1".to_string(),
                duration_minutes: 45,
            })
            .await;
        assert!(matches!(result, Err(RecordError::Unavailable(_))));
    }
}
