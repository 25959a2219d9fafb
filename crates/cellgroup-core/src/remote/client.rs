//! REST client for the hosted cell group database.
//!
//! The backend exposes one table per entity class under `/rest/v1/`, filtered
//! with PostgREST query syntax (`?id=eq.<id>`). Requests carry the project
//! API key both as `apikey` and as the bearer token.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{header, Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{Event, Member};
use crate::operation::{Operation, ATTENDANCE, EVENTS, MEMBERS, PRAYER_REQUESTS};

use super::RemoteError;

// ============================================================================
// Constants
// ============================================================================

/// Path prefix for table endpoints
const REST_PATH: &str = "rest/v1";

/// Default HTTP request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) reads.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// One attendance row per event and meeting date.
const ATTENDANCE_CONFLICT: &str = "eventId,date";

/// Executes queued operations against the remote store.
///
/// Implementations return `Ok(())` only once the server has confirmed the
/// write. Errors carry their own transient/permanent classification.
pub trait RemoteStore: Send + Sync {
    fn execute<'a>(&'a self, operation: &'a Operation) -> BoxFuture<'a, Result<(), RemoteError>>;
}

/// HTTP client for the hosted backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestRemote {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl RestRemote {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::ACCEPT, "application/json")
    }

    /// Map transport failures to the error variants the sync engine
    /// classifies on.
    fn map_send_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            RemoteError::Unreachable(e.to_string())
        } else {
            RemoteError::NetworkError(e)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status.as_u16(), &body))
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), RemoteError> {
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Insert a row, merging into an existing row with the same key.
    ///
    /// A write can reach the server and still be replayed if the
    /// confirmation is lost, so inserts are upserts.
    async fn upsert<B: Serialize>(&self, table: &str, conflict_columns: &str, body: &B) -> Result<(), RemoteError> {
        self.send(self.upsert_request(table, conflict_columns, body)).await
    }

    fn upsert_request<B: Serialize>(&self, table: &str, conflict_columns: &str, body: &B) -> RequestBuilder {
        self.request(Method::POST, table)
            .query(&[("on_conflict", conflict_columns)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(body)
    }

    async fn patch<B: Serialize>(&self, table: &str, id: &str, body: &B) -> Result<(), RemoteError> {
        let request = self
            .request(Method::PATCH, table)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=minimal")
            .json(body);
        self.send(request).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let request = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request).await
    }

    async fn get<T: DeserializeOwned>(&self, table: &str, filters: &[(&str, String)]) -> Result<T, RemoteError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .request(Method::GET, table)
                .query(&[("select", "*")])
                .query(filters)
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;

            match Self::check_response(response).await {
                Ok(response) => {
                    return response
                        .json()
                        .await
                        .map_err(|e| RemoteError::InvalidResponse(e.to_string()));
                }
                Err(RemoteError::RateLimited) if retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    warn!(table, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ===== Operation Dispatch =====

    async fn apply(&self, operation: &Operation) -> Result<(), RemoteError> {
        debug!(kind = %operation.kind(), entity = %operation.entity_key(), "Applying operation");
        match operation {
            Operation::CreateMember(member) => self.upsert(MEMBERS, "id", member).await,
            Operation::UpdateMember { id, patch } => self.patch(MEMBERS, id, patch).await,
            Operation::DeleteMember { id } => self.delete(MEMBERS, id).await,
            Operation::CreateEvent(event) => self.upsert(EVENTS, "id", event).await,
            Operation::UpdateEvent { id, patch } => self.patch(EVENTS, id, patch).await,
            Operation::DeleteEvent { id } => self.delete(EVENTS, id).await,
            Operation::SaveAttendance(record) => self.upsert(ATTENDANCE, ATTENDANCE_CONFLICT, record).await,
            Operation::CreatePrayerRequest(request) => {
                self.upsert(PRAYER_REQUESTS, "id", request).await
            }
        }
    }

    // ===== Data Fetching Methods =====

    /// Fetch all members of a cell group
    pub async fn fetch_members(&self, cell_id: &str) -> Result<Vec<Member>, RemoteError> {
        self.get(MEMBERS, &[("cellId", format!("eq.{}", cell_id))]).await
    }

    /// Fetch all events of a cell group
    pub async fn fetch_events(&self, cell_id: &str) -> Result<Vec<Event>, RemoteError> {
        self.get(EVENTS, &[("cellId", format!("eq.{}", cell_id))]).await
    }
}

impl RemoteStore for RestRemote {
    fn execute<'a>(&'a self, operation: &'a Operation) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(self.apply(operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceRecord;

    #[test]
    fn test_table_url_strips_trailing_slash() {
        let remote = RestRemote::new("https://db.example.org/", "anon").unwrap();
        assert_eq!(remote.base_url(), "https://db.example.org");
        assert_eq!(remote.table_url(MEMBERS), "https://db.example.org/rest/v1/members");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Port 9 on loopback is the discard service; nothing listens there in CI
        let remote =
            RestRemote::with_timeout("http://127.0.0.1:9", "anon", Duration::from_secs(2)).unwrap();
        let err = remote
            .execute(&Operation::DeleteMember { id: "m1".to_string() })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_events_unreachable_is_transient() {
        let remote =
            RestRemote::with_timeout("http://127.0.0.1:9", "anon", Duration::from_secs(2)).unwrap();
        let err = remote.fetch_events("c1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_attendance_upsert_merges_on_event_and_date() {
        let remote = RestRemote::new("https://db.example.org", "anon").unwrap();
        let record = AttendanceRecord {
            event_id: "e7".to_string(),
            cell_id: "c1".to_string(),
            date: "2026-03-06".to_string(),
            present_member_ids: vec![],
            visitor_count: 0,
            notes: None,
        };

        let request = remote
            .upsert_request(ATTENDANCE, ATTENDANCE_CONFLICT, &record)
            .build()
            .unwrap();

        let conflict = request
            .url()
            .query_pairs()
            .find(|(name, _)| name == "on_conflict")
            .map(|(_, value)| value.into_owned());
        assert_eq!(conflict.as_deref(), Some("eventId,date"));
        assert_eq!(request.headers()["apikey"], "anon");
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer anon");
    }
}
