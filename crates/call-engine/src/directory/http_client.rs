//! HTTP signaling directory client.
//!
//! - `POST {base}/participants` registers
//! - `GET {base}/participants?roomId=` lists the room
//! - `DELETE {base}/participants?roomId=&participantId=` deregisters

use super::{DirectoryEntry, DirectoryError, Registration, RosterResponse, SignalingDirectory};
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Connect timeout for directory requests.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Directory client over HTTP.
#[derive(Clone, Debug)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    /// Create a new directory client.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::Unavailable` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                error!(target: "call.directory", error = %e, "Failed to build HTTP client");
                DirectoryError::Unavailable("HTTP client unavailable".to_string())
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn participants_url(&self) -> String {
        format!("{}/participants", self.base_url)
    }

    /// Map a non-success status onto `DirectoryError`.
    fn check_status(response: &Response) -> Result<(), DirectoryError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            warn!(target: "call.directory", status = %status, "Directory returned server error");
            Err(DirectoryError::Unavailable(format!("status {status}")))
        } else {
            warn!(target: "call.directory", status = %status, "Directory rejected request");
            Err(DirectoryError::Rejected(status.as_u16()))
        }
    }
}

fn transport_error(e: &reqwest::Error) -> DirectoryError {
    warn!(target: "call.directory", error = %e, "Directory request failed");
    DirectoryError::Unavailable("Signaling directory is unavailable".to_string())
}

#[async_trait]
impl SignalingDirectory for HttpDirectory {
    #[instrument(skip_all, fields(room_id = %registration.room_id, participant_id = %registration.participant_id))]
    async fn register(&self, registration: &Registration) -> Result<(), DirectoryError> {
        let response = self
            .client
            .post(self.participants_url())
            .json(registration)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::check_status(&response)?;
        debug!(target: "call.directory", "Registered");
        Ok(())
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn roster(&self, room_id: &str) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let response = self
            .client
            .get(self.participants_url())
            .query(&[("roomId", room_id)])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::check_status(&response)?;
        let body: RosterResponse = response.json().await.map_err(|e| {
            warn!(target: "call.directory", error = %e, "Failed to parse roster");
            DirectoryError::InvalidResponse(e.to_string())
        })?;
        Ok(body.participants)
    }

    #[instrument(skip_all, fields(room_id = %room_id, participant_id = %participant_id))]
    async fn deregister(&self, room_id: &str, participant_id: &str) -> Result<(), DirectoryError> {
        let response = self
            .client
            .delete(self.participants_url())
            .query(&[("roomId", room_id), ("participantId", participant_id)])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        // Already gone is as good as deleted
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(&response)?;
        debug!(target: "call.directory", "Deregistered");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::link::LinkAddress;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpDirectory {
        HttpDirectory::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_register_posts_camel_case_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/participants"))
            .and(body_json(serde_json::json!({
                "roomId": "room-1",
                "participantId": "p-1",
                "linkAddress": "mem-0001-p-1",
                "displayName": "Pat"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registration = Registration {
            room_id: "room-1".to_string(),
            participant_id: "p-1".to_string(),
            link_address: LinkAddress::from("mem-0001-p-1"),
            display_name: "Pat".to_string(),
        };
        client(&mock_server).register(&registration).await.unwrap();
    }

    #[tokio::test]
    async fn test_roster_parses_participants() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/participants"))
            .and(query_param("roomId", "room-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "participants": [
                    {"participantId": "p-1", "displayName": "Pat", "linkAddress": "mem-1"},
                    {"participantId": "p-2", "displayName": "Sam"}
                ]
            })))
            .mount(&mock_server)
            .await;

        let roster = client(&mock_server).roster("room-1").await.unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(
            roster.first().unwrap().link_address,
            Some(LinkAddress::from("mem-1"))
        );
        assert!(roster.get(1).unwrap().link_address.is_none());
    }

    #[tokio::test]
    async fn test_roster_server_error_is_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/participants"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server).roster("room-1").await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_roster_malformed_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/participants"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server).roster("room-1").await;
        assert!(matches!(result, Err(DirectoryError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_deregister_tolerates_missing_entry() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/participants"))
            .and(query_param("roomId", "room-1"))
            .and(query_param("participantId", "p-1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&mock_server)
            .await;

        let directory = client(&mock_server);
        directory.deregister("room-1", "p-1").await.unwrap();
        directory.deregister("room-1", "p-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/participants"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&mock_server)
            .await;

        let registration = Registration {
            room_id: "room-1".to_string(),
            participant_id: "p-1".to_string(),
            link_address: LinkAddress::from("mem-1"),
            display_name: "Pat".to_string(),
        };
        let result = client(&mock_server).register(&registration).await;
        assert_eq!(result, Err(DirectoryError::Rejected(400)));
    }

    #[tokio::test]
    async fn test_unreachable_directory() {
        // Nothing listens on this port
        let directory =
            HttpDirectory::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let result = directory.roster("room-1").await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }
}
