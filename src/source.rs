//! # Segment Sources
//!
//! The tracker's boundary with the outside world. A [`SegmentSource`]
//! supplies the candidate segments for a subject and the reference trace for
//! a segment. Fetching them over a network API, authenticating, and mapping
//! provider payloads are the host's concern.
//!
//! [`CachedSegmentSource`] puts the shared [`Cache`] in front of any source, so
//! a prefetch and a later awaited fetch of the same trace cost one upstream
//! call, across every session that uses it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::cache::{Cache, CacheOptions};
use crate::error::Result;
use crate::{ReferenceTrace, Segment, SegmentId, TrackerConfig};

/// Provider of segments and reference efforts.
pub trait SegmentSource: Send + Sync {
    /// Segments worth matching for this subject.
    fn candidate_segments<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<Vec<Segment>>>;

    /// The subject's reference effort on a segment, if one exists.
    fn reference_trace<'a>(
        &'a self,
        segment_id: SegmentId,
        subject_id: &'a str,
        filter: &'a TraceFilter,
    ) -> BoxFuture<'a, Result<Option<Arc<ReferenceTrace>>>>;
}

/// Restricts which recorded effort is used as the reference, by start date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceFilter {
    /// Only efforts started at or after this instant
    pub after: Option<DateTime<Utc>>,
    /// Only efforts started before this instant
    pub before: Option<DateTime<Utc>>,
}

impl TraceFilter {
    /// Whether an effort started at `started_at` passes the filter.
    pub fn accepts(&self, started_at: DateTime<Utc>) -> bool {
        self.after.map_or(true, |after| started_at >= after)
            && self.before.map_or(true, |before| started_at < before)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TraceKey {
    segment_id: SegmentId,
    subject_id: String,
    filter: TraceFilter,
}

/// A [`SegmentSource`] wrapper that caches segment lists and traces.
pub struct CachedSegmentSource<S> {
    inner: Arc<S>,
    segments: Cache<String, Arc<Vec<Segment>>>,
    traces: Cache<TraceKey, Option<Arc<ReferenceTrace>>>,
    segment_options: CacheOptions,
    trace_options: CacheOptions,
}

impl<S> CachedSegmentSource<S>
where
    S: SegmentSource + 'static,
{
    pub fn new(inner: S, config: &TrackerConfig) -> Self {
        let check_period = Duration::from_secs(config.cache_check_period_secs);
        Self {
            inner: Arc::new(inner),
            segments: Cache::new(check_period),
            traces: Cache::new(check_period),
            segment_options: config.segment_cache,
            trace_options: config.trace_cache,
        }
    }

    /// Start background sweeps for both caches.
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![self.segments.spawn_sweeper(), self.traces.spawn_sweeper()]
    }

    /// Forget a subject's segment list so the next call refetches it.
    pub fn invalidate_segments(&self, subject_id: &str) {
        self.segments.invalidate(&subject_id.to_string());
    }

    /// Number of cached traces (including in-flight fetches).
    pub fn cached_trace_count(&self) -> usize {
        self.traces.len()
    }
}

impl<S> SegmentSource for CachedSegmentSource<S>
where
    S: SegmentSource + 'static,
{
    fn candidate_segments<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<Vec<Segment>>> {
        async move {
            let inner = Arc::clone(&self.inner);
            let subject = subject_id.to_string();
            let segments = self
                .segments
                .get_or_create(subject.clone(), self.segment_options, move || async move {
                    debug!("[CachedSegmentSource] Fetching segments for {}", subject);
                    inner.candidate_segments(&subject).await.map(Arc::new)
                })
                .await?;
            Ok(segments.as_ref().clone())
        }
        .boxed()
    }

    fn reference_trace<'a>(
        &'a self,
        segment_id: SegmentId,
        subject_id: &'a str,
        filter: &'a TraceFilter,
    ) -> BoxFuture<'a, Result<Option<Arc<ReferenceTrace>>>> {
        async move {
            let inner = Arc::clone(&self.inner);
            let key = TraceKey {
                segment_id,
                subject_id: subject_id.to_string(),
                filter: filter.clone(),
            };
            let subject = key.subject_id.clone();
            let filter = key.filter.clone();
            self.traces
                .get_or_create(key, self.trace_options, move || async move {
                    debug!(
                        "[CachedSegmentSource] Fetching trace for segment {} ({})",
                        segment_id, subject
                    );
                    inner.reference_trace(segment_id, &subject, &filter).await
                })
                .await
        }
        .boxed()
    }
}

/// An in-memory source with a fixed segment list.
///
/// Every subject sees the same segments and traces.
#[derive(Debug, Clone, Default)]
pub struct StaticSegmentSource {
    segments: Vec<Segment>,
    traces: HashMap<SegmentId, Arc<ReferenceTrace>>,
}

impl StaticSegmentSource {
    pub fn new(segments: Vec<Segment>, traces: HashMap<SegmentId, ReferenceTrace>) -> Self {
        Self {
            segments,
            traces: traces
                .into_iter()
                .map(|(id, trace)| (id, Arc::new(trace)))
                .collect(),
        }
    }

    /// Replace the reference trace for a segment.
    pub fn set_trace(&mut self, segment_id: SegmentId, trace: ReferenceTrace) {
        self.traces.insert(segment_id, Arc::new(trace));
    }
}

impl SegmentSource for StaticSegmentSource {
    fn candidate_segments<'a>(&'a self, _subject_id: &'a str) -> BoxFuture<'a, Result<Vec<Segment>>> {
        futures::future::ready(Ok(self.segments.clone())).boxed()
    }

    fn reference_trace<'a>(
        &'a self,
        segment_id: SegmentId,
        _subject_id: &'a str,
        _filter: &'a TraceFilter,
    ) -> BoxFuture<'a, Result<Option<Arc<ReferenceTrace>>>> {
        futures::future::ready(Ok(self.traces.get(&segment_id).cloned())).boxed()
    }
}

/// Union of two segment lists by id.
///
/// `base` keeps its order; segments from `extra` are appended unless a
/// segment with the same id is already present.
pub fn merge_segments(base: Vec<Segment>, extra: impl IntoIterator<Item = Segment>) -> Vec<Segment> {
    let mut seen: HashSet<SegmentId> = base.iter().map(|s| s.id).collect();
    let mut merged = base;
    for segment in extra {
        if seen.insert(segment.id) {
            merged.push(segment);
        }
    }
    merged
}
