use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::fhir::{
    FhirApiError, FhirSearchClient, OffsetRange, ResourceCount, SortOrder, TimeWindow,
};

/// Sentinel cumulative count for windows the upstream refused to tally.
/// Behaves as larger than any bound, so bisection keeps shrinking the window
/// until the server agrees to count it.
const SATURATED: u64 = u64::MAX;

/// A slice of the extraction window sized for one processing job.
#[derive(Clone, Debug, PartialEq)]
pub struct SubJob {
    pub window: TimeWindow,
    pub expected_size: u64,
}

/// Splits an extraction window into sub-jobs whose expected resource count
/// falls within `[low_bound, high_bound)` wherever the data allows, by binary
/// searching `lastUpdated` boundaries against upstream summary counts.
pub struct ProcessingJobSplitter {
    client: Arc<dyn FhirSearchClient>,
    low_bound: u64,
    high_bound: u64,
}

impl ProcessingJobSplitter {
    pub fn new(client: Arc<dyn FhirSearchClient>, low_bound: u64, high_bound: u64) -> Self {
        Self {
            client,
            low_bound,
            high_bound,
        }
    }

    /// Prepares a lazy stream of sub-jobs covering `window`. The yielded
    /// windows are contiguous, non-overlapping, and their union is exactly
    /// `window`; all but the final one carry at least `low_bound` resources
    /// when the data makes that feasible.
    pub async fn split(
        &self,
        resource_type: &str,
        window: TimeWindow,
    ) -> Result<SubJobStream, SplitError> {
        let total = self.client.count(resource_type, window).await?;

        let state = match total {
            ResourceCount::Exact(0) => StreamState::Drained,
            ResourceCount::Exact(count) if count < self.high_bound => {
                StreamState::Single { size: count }
            }
            _ => {
                let first = self
                    .client
                    .boundary_timestamp(resource_type, window, SortOrder::Ascending)
                    .await?
                    .ok_or(SplitError::InconsistentUpstream)?;
                let last = self
                    .client
                    .boundary_timestamp(resource_type, window, SortOrder::Descending)
                    .await?
                    .ok_or(SplitError::InconsistentUpstream)?;

                let total = total.as_exact().unwrap_or(SATURATED);

                let mut anchors = BTreeMap::new();
                anchors.insert(first, 0);
                anchors.insert(last, total);
                anchors.insert(window.end, total);

                StreamState::Walking {
                    anchors,
                    first_boundary: first,
                    cursor_start: window.start,
                    cursor_count: 0,
                    scan_position: None,
                    total,
                }
            }
        };

        Ok(SubJobStream {
            client: self.client.clone(),
            resource_type: resource_type.to_string(),
            low_bound: self.low_bound,
            high_bound: self.high_bound,
            window,
            state,
        })
    }
}

/// Pull-based sub-job sequence. The orchestrator takes one sub-job at a time;
/// counting queries only happen while a pull is in progress.
pub struct SubJobStream {
    client: Arc<dyn FhirSearchClient>,
    resource_type: String,
    low_bound: u64,
    high_bound: u64,

    window: TimeWindow,
    state: StreamState,
}

enum StreamState {
    Single {
        size: u64,
    },
    Walking {
        /// timestamp → cumulative count of resources since the window start
        anchors: BTreeMap<OffsetDateTime, u64>,
        first_boundary: OffsetDateTime,
        cursor_start: Option<OffsetDateTime>,
        cursor_count: u64,
        /// walk position within the anchor map; trails behind skipped anchors
        /// without moving the cursor
        scan_position: Option<OffsetDateTime>,
        total: u64,
    },
    Drained,
}

impl SubJobStream {
    pub async fn next(&mut self) -> Result<Option<SubJob>, SplitError> {
        match std::mem::replace(&mut self.state, StreamState::Drained) {
            StreamState::Drained => Ok(None),
            StreamState::Single { size } => Ok(Some(SubJob {
                window: self.window,
                expected_size: size,
            })),
            StreamState::Walking {
                anchors,
                first_boundary,
                cursor_start,
                cursor_count,
                scan_position,
                total,
            } => {
                let mut walk = Walk {
                    client: self.client.clone(),
                    resource_type: self.resource_type.clone(),
                    low_bound: self.low_bound,
                    high_bound: self.high_bound,
                    window: self.window,
                    anchors,
                    first_boundary,
                    cursor_start,
                    cursor_count,
                    scan_position,
                    total,
                };

                let yielded = walk.advance().await?;

                if yielded.is_some() && walk.cursor_start != Some(self.window.end) {
                    self.state = StreamState::Walking {
                        anchors: walk.anchors,
                        first_boundary: walk.first_boundary,
                        cursor_start: walk.cursor_start,
                        cursor_count: walk.cursor_count,
                        scan_position: walk.scan_position,
                        total: walk.total,
                    };
                }

                Ok(yielded)
            }
        }
    }
}

struct Walk {
    client: Arc<dyn FhirSearchClient>,
    resource_type: String,
    low_bound: u64,
    high_bound: u64,

    window: TimeWindow,
    anchors: BTreeMap<OffsetDateTime, u64>,
    first_boundary: OffsetDateTime,
    cursor_start: Option<OffsetDateTime>,
    cursor_count: u64,
    scan_position: Option<OffsetDateTime>,
    total: u64,
}

impl Walk {
    /// Walks anchors until one more sub-job can be produced.
    async fn advance(&mut self) -> Result<Option<SubJob>, SplitError> {
        loop {
            let candidate = self.next_anchor();

            let (anchor_ts, cumulative) = match candidate {
                Some(found) => found,
                None => {
                    // anchors exhausted; close out whatever sliver remains so
                    // the yielded windows still partition the input exactly
                    if self.cursor_start != Some(self.window.end) {
                        let remaining = if self.total == SATURATED {
                            0
                        } else {
                            self.total.saturating_sub(self.cursor_count)
                        };

                        return Ok(Some(
                            self.emit(self.window.end, self.cursor_count.saturating_add(remaining)),
                        ));
                    }

                    return Ok(None);
                }
            };

            let delta = delta_from(cumulative, self.cursor_count);

            if anchor_ts == self.window.end {
                if delta <= self.high_bound {
                    // the closing sub-job takes whatever remains, undersized
                    // or not
                    let size = if self.total == SATURATED {
                        delta
                    } else {
                        self.total.saturating_sub(self.cursor_count)
                    };

                    return Ok(Some(self.emit(anchor_ts, self.cursor_count.saturating_add(size))));
                }
            } else if delta < self.low_bound {
                // too small to stand alone; fold into the next range
                self.scan_position = Some(anchor_ts);
                continue;
            } else if delta <= self.high_bound {
                return Ok(Some(self.emit(anchor_ts, cumulative)));
            }

            // oversized gap between the cursor and this anchor
            let (split_ts, split_cumulative) = self.bisect(anchor_ts).await?;
            let split_delta = delta_from(split_cumulative, self.cursor_count);

            if split_delta == 0 {
                if self.scan_position.map_or(false, |scan| split_ts <= scan) {
                    // bisection is stuck against sub-millisecond data; the
                    // anchor itself is the only boundary left, oversized or
                    // not
                    let measured = self.measure(anchor_ts).await?;
                    self.anchors.insert(anchor_ts, measured);
                    return Ok(Some(self.emit(anchor_ts, measured)));
                }

                // the gap's weight sits entirely past the split point
                self.anchors.insert(split_ts, split_cumulative);
                self.scan_position = Some(split_ts);
                continue;
            }

            return Ok(Some(self.emit(split_ts, split_cumulative)));
        }
    }

    fn next_anchor(&self) -> Option<(OffsetDateTime, u64)> {
        let after = match (self.cursor_start, self.scan_position) {
            (Some(cursor), Some(scan)) => Some(cursor.max(scan)),
            (Some(cursor), None) => Some(cursor),
            (None, Some(scan)) => Some(scan),
            (None, None) => None,
        };

        let range = match after {
            Some(position) => self
                .anchors
                .range((Bound::Excluded(position), Bound::Unbounded)),
            None => self.anchors.range(..),
        };

        range.map(|(ts, count)| (*ts, *count)).next()
    }

    fn emit(&mut self, end: OffsetDateTime, cumulative: u64) -> SubJob {
        let sub_job = SubJob {
            window: TimeWindow::new(self.cursor_start, end),
            expected_size: delta_from(cumulative, self.cursor_count),
        };

        self.cursor_start = Some(end);
        self.cursor_count = cumulative;
        self.scan_position = Some(end);

        sub_job
    }

    /// Binary search for a split point between the cursor and an oversized
    /// anchor. Returns the first midpoint whose delta lands within bounds;
    /// once millisecond resolution is reached, prefers the earlier boundary
    /// when it makes progress and otherwise accepts the oversized endpoint.
    async fn bisect(
        &mut self,
        high_ts: OffsetDateTime,
    ) -> Result<(OffsetDateTime, u64), SplitError> {
        let floor = match self.cursor_start {
            Some(cursor) => cursor.max(self.first_boundary),
            None => self.first_boundary,
        };

        let mut low_ms = unix_millis(floor);
        let mut high_ms = unix_millis(high_ts);

        while high_ms - low_ms > 1 {
            let mid_ms = low_ms + (high_ms - low_ms) / 2;
            let mid = from_unix_millis(mid_ms);

            let measured = self.measure(mid).await?;
            self.anchors.insert(mid, measured);

            let delta = delta_from(measured, self.cursor_count);

            if (self.low_bound..=self.high_bound).contains(&delta) {
                return Ok((mid, measured));
            }

            if delta > self.high_bound {
                high_ms = mid_ms;
            } else {
                low_ms = mid_ms;
            }
        }

        if low_ms > unix_millis(floor) {
            let low = from_unix_millis(low_ms);
            let measured = match self.anchors.get(&low) {
                Some(measured) => *measured,
                None => self.measure(low).await?,
            };

            return Ok((low, measured));
        }

        let high = from_unix_millis(high_ms).min(high_ts);
        let measured = self.measure(high).await?;
        self.anchors.insert(high, measured);

        Ok((high, measured))
    }

    /// Cumulative count at `ts`, measured from the current cursor so anchor
    /// estimates never compound.
    async fn measure(&self, ts: OffsetDateTime) -> Result<u64, SplitError> {
        let window = TimeWindow::new(self.cursor_start.or(self.window.start), ts);

        let counted = self
            .client
            .count(&self.resource_type, window)
            .await?;

        Ok(match counted {
            ResourceCount::Exact(count) => self.cursor_count.saturating_add(count),
            ResourceCount::ManyMatches => SATURATED,
        })
    }
}

fn delta_from(cumulative: u64, cursor_count: u64) -> u64 {
    if cumulative == SATURATED {
        return SATURATED;
    }

    cumulative.saturating_sub(cursor_count)
}

fn unix_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Offset-range splitting for DICOM change feeds. Offsets are dense, so
/// fixed-size chunks replace the counted search.
pub fn split_offsets(range: OffsetRange, chunk_size: i64) -> Vec<OffsetRange> {
    let mut chunks = Vec::new();

    if chunk_size <= 0 {
        return chunks;
    }

    let mut start = range.start;
    while start < range.end {
        let end = (start + chunk_size).min(range.end);
        chunks.push(OffsetRange { start, end });
        start = end;
    }

    chunks
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("upstream search failed: {0}")]
    Api(#[from] FhirApiError),

    #[error("upstream reported matches but returned no boundary timestamps")]
    InconsistentUpstream,
}

impl SplitError {
    pub fn is_retriable(&self) -> bool {
        match self {
            SplitError::Api(err) => err.is_retriable(),
            SplitError::InconsistentUpstream => true,
        }
    }
}
