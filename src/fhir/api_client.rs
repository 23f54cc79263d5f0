use std::sync::Arc;

use async_trait::async_trait;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::fhir::{
    ChangeFeedClient, FhirApiError, FhirSearchClient, OffsetRange, ResourceCount, SearchPage,
    SortOrder, TimeWindow,
};

const SEARCH_PAGE_SIZE: u32 = 1000;

/// Maximum change-feed entries one request may ask for, mirroring the service
/// limit.
const CHANGE_FEED_PAGE_LIMIT: i64 = 200;

/// Supplies bearer credentials for upstream requests. Credential acquisition
/// itself (managed identity, client secrets, token caching) lives outside
/// this crate.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>, FhirApiError>;
}

/// Used against servers that accept unauthenticated traffic, mostly local
/// emulators and test fixtures.
pub struct AnonymousAccess;

#[async_trait]
impl TokenProvider for AnonymousAccess {
    async fn access_token(&self) -> Result<Option<String>, FhirApiError> {
        Ok(None)
    }
}

/// A fixed bearer token handed in through configuration.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl ToString) -> Self {
        Self(token.to_string())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<Option<String>, FhirApiError> {
        Ok(Some(self.0.clone()))
    }
}

/// `Url::join` drops the last path segment of bases missing a trailing
/// slash, which would silently retarget every query.
fn normalize_base(mut base_url: Url) -> Url {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    base_url
}

/// Production implementation of [`FhirSearchClient`] over the FHIR REST API.
#[derive(Clone)]
pub struct FhirApiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn TokenProvider>,
}

impl FhirApiClient {
    pub fn new(base_url: Url, credentials: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base(base_url),
            credentials,
        }
    }

    fn search_url(&self, resource_type: &str, window: TimeWindow) -> Result<Url, FhirApiError> {
        let mut url = self
            .base_url
            .join(resource_type)
            .map_err(FhirApiError::BadQuery)?;

        append_window(&mut url, window)?;

        Ok(url)
    }

    async fn fetch_json(&self, url: Url) -> Result<serde_json::Value, FhirApiError> {
        let mut request = self.http.get(url.clone());

        if let Some(token) = self.credentials.access_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(FhirApiError::Request)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();

            // servers report refused counts as a too-costly operation outcome
            if body.contains("too-costly") {
                return Err(FhirApiError::UnexpectedStatus(
                    status.as_u16(),
                    "too-costly".to_string(),
                ));
            }

            return Err(FhirApiError::UnexpectedStatus(
                status.as_u16(),
                url.to_string(),
            ));
        }

        response.json().await.map_err(FhirApiError::Request)
    }

    async fn fetch_bundle_page(&self, url: Url) -> Result<SearchPage, FhirApiError> {
        let bundle = self.fetch_json(url).await?;

        let resources = bundle
            .get("entry")
            .and_then(|entries| entries.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("resource").cloned())
                    .collect()
            })
            .unwrap_or_default();

        let continuation = bundle
            .get("link")
            .and_then(|links| links.as_array())
            .and_then(|links| {
                links.iter().find(|link| {
                    link.get("relation").and_then(|relation| relation.as_str()) == Some("next")
                })
            })
            .and_then(|link| link.get("url"))
            .and_then(|link_url| link_url.as_str())
            .map(|link_url| link_url.to_string());

        Ok(SearchPage {
            resources,
            continuation,
        })
    }
}

#[async_trait]
impl FhirSearchClient for FhirApiClient {
    async fn count(
        &self,
        resource_type: &str,
        window: TimeWindow,
    ) -> Result<ResourceCount, FhirApiError> {
        let mut url = self.search_url(resource_type, window)?;
        url.query_pairs_mut().append_pair("_summary", "count");

        match self.fetch_json(url).await {
            Ok(bundle) => bundle
                .get("total")
                .and_then(|total| total.as_u64())
                .map(ResourceCount::Exact)
                .ok_or_else(|| {
                    FhirApiError::MalformedResponse(
                        "count bundle had no usable total".to_string(),
                    )
                }),
            // a refused count means "more than the server will tally"
            Err(FhirApiError::UnexpectedStatus(_, detail)) if detail == "too-costly" => {
                Ok(ResourceCount::ManyMatches)
            }
            Err(err) => Err(err),
        }
    }

    async fn boundary_timestamp(
        &self,
        resource_type: &str,
        window: TimeWindow,
        order: SortOrder,
    ) -> Result<Option<OffsetDateTime>, FhirApiError> {
        let mut url = self.search_url(resource_type, window)?;

        let sort = match order {
            SortOrder::Ascending => "_lastUpdated",
            SortOrder::Descending => "-_lastUpdated",
        };

        url.query_pairs_mut()
            .append_pair("_count", "1")
            .append_pair("_sort", sort);

        let page = self.fetch_bundle_page(url).await?;

        let resource = match page.resources.first() {
            Some(resource) => resource,
            None => return Ok(None),
        };

        let raw = resource
            .get("meta")
            .and_then(|meta| meta.get("lastUpdated"))
            .and_then(|last_updated| last_updated.as_str())
            .ok_or_else(|| {
                FhirApiError::MalformedResponse("resource missing meta.lastUpdated".to_string())
            })?;

        OffsetDateTime::parse(raw, &Rfc3339)
            .map(Some)
            .map_err(|err| FhirApiError::MalformedResponse(err.to_string()))
    }

    async fn page(
        &self,
        resource_type: &str,
        window: TimeWindow,
        continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError> {
        let url = match continuation {
            Some(next) => Url::parse(&next).map_err(FhirApiError::BadQuery)?,
            None => {
                let mut url = self.search_url(resource_type, window)?;
                url.query_pairs_mut()
                    .append_pair("_count", &SEARCH_PAGE_SIZE.to_string());
                url
            }
        };

        self.fetch_bundle_page(url).await
    }

    async fn group_patient_ids(&self, group_id: &str) -> Result<Vec<String>, FhirApiError> {
        let url = self
            .base_url
            .join(&format!("Group/{group_id}"))
            .map_err(FhirApiError::BadQuery)?;

        let group = self.fetch_json(url).await?;

        let mut patient_ids: Vec<String> = group
            .get("member")
            .and_then(|members| members.as_array())
            .map(|members| {
                members
                    .iter()
                    .filter_map(|member| {
                        member
                            .get("entity")
                            .and_then(|entity| entity.get("reference"))
                            .and_then(|reference| reference.as_str())
                    })
                    .filter_map(|reference| reference.strip_prefix("Patient/"))
                    .map(|patient_id| patient_id.to_string())
                    .collect()
            })
            .unwrap_or_default();

        patient_ids.sort();
        patient_ids.dedup();

        Ok(patient_ids)
    }

    async fn patient(&self, patient_id: &str) -> Result<Option<serde_json::Value>, FhirApiError> {
        let url = self
            .base_url
            .join(&format!("Patient/{patient_id}"))
            .map_err(FhirApiError::BadQuery)?;

        match self.fetch_json(url).await {
            Ok(resource) => Ok(Some(resource)),
            Err(FhirApiError::UnexpectedStatus(404, _)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn patient_resources(
        &self,
        patient_id: &str,
        resource_type: &str,
        window: TimeWindow,
        continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError> {
        let url = match continuation {
            Some(next) => Url::parse(&next).map_err(FhirApiError::BadQuery)?,
            None => {
                let mut url = self.search_url(resource_type, window)?;
                url.query_pairs_mut()
                    .append_pair("patient", patient_id)
                    .append_pair("_count", &SEARCH_PAGE_SIZE.to_string());
                url
            }
        };

        self.fetch_bundle_page(url).await
    }
}

/// Production implementation of [`ChangeFeedClient`] over the DICOMweb change
/// feed endpoints.
#[derive(Clone)]
pub struct DicomWebClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn TokenProvider>,
}

impl DicomWebClient {
    pub fn new(base_url: Url, credentials: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base(base_url),
            credentials,
        }
    }

    async fn fetch_json(&self, url: Url) -> Result<serde_json::Value, FhirApiError> {
        let mut request = self.http.get(url.clone());

        if let Some(token) = self.credentials.access_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(FhirApiError::Request)?;
        let status = response.status();

        if !status.is_success() {
            return Err(FhirApiError::UnexpectedStatus(
                status.as_u16(),
                url.to_string(),
            ));
        }

        response.json().await.map_err(FhirApiError::Request)
    }
}

#[async_trait]
impl ChangeFeedClient for DicomWebClient {
    async fn latest_sequence(&self) -> Result<i64, FhirApiError> {
        let url = self
            .base_url
            .join("changefeed/latest")
            .map_err(FhirApiError::BadQuery)?;

        let entry = self.fetch_json(url).await?;

        entry
            .get("sequence")
            .and_then(|sequence| sequence.as_i64())
            .ok_or_else(|| {
                FhirApiError::MalformedResponse(
                    "latest change feed entry had no sequence".to_string(),
                )
            })
    }

    async fn entries(&self, range: OffsetRange) -> Result<Vec<serde_json::Value>, FhirApiError> {
        let mut collected = Vec::new();
        let mut offset = range.start;

        while offset < range.end {
            let limit = (range.end - offset).min(CHANGE_FEED_PAGE_LIMIT);

            let mut url = self
                .base_url
                .join("changefeed")
                .map_err(FhirApiError::BadQuery)?;
            url.query_pairs_mut()
                .append_pair("offset", &offset.to_string())
                .append_pair("limit", &limit.to_string())
                .append_pair("includeMetadata", "true");

            let page = self.fetch_json(url).await?;
            let entries = page.as_array().cloned().ok_or_else(|| {
                FhirApiError::MalformedResponse("change feed page was not an array".to_string())
            })?;

            if entries.is_empty() {
                break;
            }

            offset += entries.len() as i64;
            collected.extend(entries);
        }

        Ok(collected)
    }
}

fn append_window(url: &mut Url, window: TimeWindow) -> Result<(), FhirApiError> {
    let mut pairs = url.query_pairs_mut();

    if let Some(start) = window.start {
        let formatted = start
            .format(&Rfc3339)
            .map_err(|err| FhirApiError::MalformedResponse(err.to_string()))?;
        pairs.append_pair("_lastUpdated", &format!("ge{formatted}"));
    }

    let formatted = window
        .end
        .format(&Rfc3339)
        .map_err(|err| FhirApiError::MalformedResponse(err.to_string()))?;
    pairs.append_pair("_lastUpdated", &format!("lt{formatted}"));

    Ok(())
}
