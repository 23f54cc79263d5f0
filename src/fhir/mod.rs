mod api_client;

pub use api_client::{AnonymousAccess, DicomWebClient, FhirApiClient, StaticToken, TokenProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Half-open extraction window `[start, end)` over `lastUpdated` instants. A
/// missing start means "from the beginning of the data".
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeWindow {
    pub fn new(start: Option<OffsetDateTime>, end: OffsetDateTime) -> Self {
        Self { start, end }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A summary count reported by the upstream. Servers refuse to count overly
/// broad queries; those saturate to `ManyMatches` and behave as larger than
/// any bound during range splitting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceCount {
    Exact(u64),
    ManyMatches,
}

impl ResourceCount {
    pub fn exceeds(&self, limit: u64) -> bool {
        match self {
            ResourceCount::Exact(count) => *count > limit,
            ResourceCount::ManyMatches => true,
        }
    }

    pub fn as_exact(&self) -> Option<u64> {
        match self {
            ResourceCount::Exact(count) => Some(*count),
            ResourceCount::ManyMatches => None,
        }
    }
}

/// One page of search results plus the continuation token for the next, when
/// the server reported one.
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    pub resources: Vec<serde_json::Value>,
    pub continuation: Option<String>,
}

/// Inclusive-start, exclusive-end slice of a DICOM change feed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

/// The queries the pipeline issues against the upstream FHIR API. The
/// splitter only uses `count` and `boundary_timestamp`; processing jobs pull
/// pages; group-scope orchestration resolves the patient compartment.
#[async_trait]
pub trait FhirSearchClient: Send + Sync {
    /// `_summary=count` over the window.
    async fn count(
        &self,
        resource_type: &str,
        window: TimeWindow,
    ) -> Result<ResourceCount, FhirApiError>;

    /// The earliest or latest `lastUpdated` within the window, via a
    /// single-record sorted query. `None` when the window is empty.
    async fn boundary_timestamp(
        &self,
        resource_type: &str,
        window: TimeWindow,
        order: SortOrder,
    ) -> Result<Option<OffsetDateTime>, FhirApiError>;

    /// One page of resources within the window, following the server's
    /// continuation link when one was returned by the previous page.
    async fn page(
        &self,
        resource_type: &str,
        window: TimeWindow,
        continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError>;

    /// Member patient ids of the configured FHIR Group.
    async fn group_patient_ids(&self, group_id: &str) -> Result<Vec<String>, FhirApiError>;

    /// The current Patient resource, used to decide whether a patient changed
    /// since the version recorded in the metadata store.
    async fn patient(&self, patient_id: &str) -> Result<Option<serde_json::Value>, FhirApiError>;

    /// One page of a patient's compartment for one resource type.
    async fn patient_resources(
        &self,
        patient_id: &str,
        resource_type: &str,
        window: TimeWindow,
        continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError>;
}

/// The change-feed queries the DICOM pipeline issues. Offsets are dense, so
/// range splitting needs no counted search.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    async fn latest_sequence(&self) -> Result<i64, FhirApiError>;

    async fn entries(&self, range: OffsetRange) -> Result<Vec<serde_json::Value>, FhirApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FhirApiError {
    #[error("couldn't build a search url: {0}")]
    BadQuery(url::ParseError),

    #[error("credential provider failed: {0}")]
    Credentials(String),

    #[error("upstream response couldn't be interpreted: {0}")]
    MalformedResponse(String),

    #[error("upstream request failed: {0}")]
    Request(reqwest::Error),

    #[error("upstream returned status {0} for {1}")]
    UnexpectedStatus(u16, String),
}

impl FhirApiError {
    /// Network trouble and server-side throttling are worth retrying; bad
    /// queries and credential failures are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            FhirApiError::Request(_) => true,
            FhirApiError::UnexpectedStatus(status, _) => {
                *status == 429 || (500..=599).contains(status)
            }
            FhirApiError::BadQuery(_)
            | FhirApiError::Credentials(_)
            | FhirApiError::MalformedResponse(_) => false,
        }
    }
}
