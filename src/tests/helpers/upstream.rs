use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::fhir::{
    ChangeFeedClient, FhirApiError, FhirSearchClient, OffsetRange, ResourceCount, SearchPage,
    SortOrder, TimeWindow,
};

const PAGE_SIZE: usize = 1000;

/// In-memory stand-in for the upstream FHIR/DICOM service. Resources are
/// represented purely by their `lastUpdated` instants (unix milliseconds),
/// which is all the splitter and processing paths observe.
#[derive(Default)]
pub(crate) struct MockFhirServer {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// resource type → sorted lastUpdated instants in unix milliseconds
    timestamps: BTreeMap<String, Vec<i64>>,

    /// counts above this report as refused, like a server that won't tally
    /// broad queries
    saturate_above: Option<u64>,

    group_members: Vec<String>,
    patients: BTreeMap<String, serde_json::Value>,
    compartments: BTreeMap<(String, String), Vec<serde_json::Value>>,

    change_feed_length: i64,

    count_queries: usize,
}

impl MockFhirServer {
    pub(crate) fn seed_uniform(&self, resource_type: &str, window: TimeWindow, count: usize) {
        let start_ms = to_ms(window.start.expect("seeding needs a concrete start"));
        let end_ms = to_ms(window.end);
        let span = (end_ms - start_ms).max(1);

        let mut inner = self.inner.lock().expect("mock state");
        let stamps = inner.timestamps.entry(resource_type.to_string()).or_default();

        for idx in 0..count {
            stamps.push(start_ms + (span * idx as i64) / count as i64);
        }
        stamps.sort_unstable();
    }

    pub(crate) fn seed_at_instant(&self, resource_type: &str, instant: OffsetDateTime, count: usize) {
        let mut inner = self.inner.lock().expect("mock state");
        let stamps = inner.timestamps.entry(resource_type.to_string()).or_default();

        stamps.extend(std::iter::repeat(to_ms(instant)).take(count));
        stamps.sort_unstable();
    }

    pub(crate) fn saturate_counts_above(&self, limit: u64) {
        self.inner.lock().expect("mock state").saturate_above = Some(limit);
    }

    pub(crate) fn seed_group(&self, members: &[(&str, i64)]) {
        let mut inner = self.inner.lock().expect("mock state");

        for (patient_id, version) in members.iter() {
            inner.group_members.push(patient_id.to_string());
            inner.patients.insert(
                patient_id.to_string(),
                json!({
                    "resourceType": "Patient",
                    "id": patient_id,
                    "meta": { "versionId": version.to_string() },
                }),
            );
        }

        inner.group_members.sort();
    }

    pub(crate) fn seed_compartment(&self, patient_id: &str, resource_type: &str, count: usize) {
        let mut inner = self.inner.lock().expect("mock state");

        let resources = inner
            .compartments
            .entry((patient_id.to_string(), resource_type.to_string()))
            .or_default();

        for idx in 0..count {
            resources.push(json!({
                "resourceType": resource_type,
                "id": format!("{patient_id}-{idx}"),
                "subject": { "reference": format!("Patient/{patient_id}") },
            }));
        }
    }

    pub(crate) fn seed_change_feed(&self, length: i64) {
        self.inner.lock().expect("mock state").change_feed_length = length;
    }

    pub(crate) fn count_queries(&self) -> usize {
        self.inner.lock().expect("mock state").count_queries
    }

    fn matching_range(stamps: &[i64], window: TimeWindow) -> (usize, usize) {
        let lower = match window.start {
            Some(start) => stamps.partition_point(|stamp| *stamp < to_ms(start)),
            None => 0,
        };
        let upper = stamps.partition_point(|stamp| *stamp < to_ms(window.end));

        // inverted windows count as empty rather than underflowing
        (lower, upper.max(lower))
    }
}

#[async_trait]
impl FhirSearchClient for MockFhirServer {
    async fn count(
        &self,
        resource_type: &str,
        window: TimeWindow,
    ) -> Result<ResourceCount, FhirApiError> {
        let mut inner = self.inner.lock().expect("mock state");
        inner.count_queries += 1;

        let matched = match inner.timestamps.get(resource_type) {
            Some(stamps) => {
                let (lower, upper) = Self::matching_range(stamps, window);
                (upper - lower) as u64
            }
            None => 0,
        };

        match inner.saturate_above {
            Some(limit) if matched > limit => Ok(ResourceCount::ManyMatches),
            _ => Ok(ResourceCount::Exact(matched)),
        }
    }

    async fn boundary_timestamp(
        &self,
        resource_type: &str,
        window: TimeWindow,
        order: SortOrder,
    ) -> Result<Option<OffsetDateTime>, FhirApiError> {
        let inner = self.inner.lock().expect("mock state");

        let stamps = match inner.timestamps.get(resource_type) {
            Some(stamps) => stamps,
            None => return Ok(None),
        };

        let (lower, upper) = Self::matching_range(stamps, window);
        if lower == upper {
            return Ok(None);
        }

        let stamp = match order {
            SortOrder::Ascending => stamps[lower],
            SortOrder::Descending => stamps[upper - 1],
        };

        Ok(Some(from_ms(stamp)))
    }

    async fn page(
        &self,
        resource_type: &str,
        window: TimeWindow,
        continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError> {
        let inner = self.inner.lock().expect("mock state");

        let stamps = match inner.timestamps.get(resource_type) {
            Some(stamps) => stamps,
            None => return Ok(SearchPage::default()),
        };

        let (lower, upper) = Self::matching_range(stamps, window);

        let offset = match continuation {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| FhirApiError::MalformedResponse("bad continuation".to_string()))?,
            None => 0,
        };

        let page_start = lower + offset;
        let page_end = (page_start + PAGE_SIZE).min(upper);

        let resources = (page_start..page_end)
            .map(|idx| {
                json!({
                    "resourceType": resource_type,
                    "id": idx.to_string(),
                    "meta": { "lastUpdated": rfc3339(stamps[idx]) },
                })
            })
            .collect();

        let continuation = if page_end < upper {
            Some((offset + PAGE_SIZE).to_string())
        } else {
            None
        };

        Ok(SearchPage {
            resources,
            continuation,
        })
    }

    async fn group_patient_ids(&self, _group_id: &str) -> Result<Vec<String>, FhirApiError> {
        Ok(self.inner.lock().expect("mock state").group_members.clone())
    }

    async fn patient(&self, patient_id: &str) -> Result<Option<serde_json::Value>, FhirApiError> {
        Ok(self
            .inner
            .lock()
            .expect("mock state")
            .patients
            .get(patient_id)
            .cloned())
    }

    async fn patient_resources(
        &self,
        patient_id: &str,
        resource_type: &str,
        _window: TimeWindow,
        _continuation: Option<String>,
    ) -> Result<SearchPage, FhirApiError> {
        let inner = self.inner.lock().expect("mock state");

        let resources = inner
            .compartments
            .get(&(patient_id.to_string(), resource_type.to_string()))
            .cloned()
            .unwrap_or_default();

        Ok(SearchPage {
            resources,
            continuation: None,
        })
    }
}

#[async_trait]
impl ChangeFeedClient for MockFhirServer {
    async fn latest_sequence(&self) -> Result<i64, FhirApiError> {
        Ok(self.inner.lock().expect("mock state").change_feed_length)
    }

    async fn entries(&self, range: OffsetRange) -> Result<Vec<serde_json::Value>, FhirApiError> {
        Ok((range.start..range.end)
            .map(|sequence| json!({ "sequence": sequence, "action": "create" }))
            .collect())
    }
}

fn to_ms(instant: OffsetDateTime) -> i64 {
    (instant.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .expect("timestamp in range")
}

fn rfc3339(ms: i64) -> String {
    from_ms(ms).format(&Rfc3339).expect("formattable instant")
}
