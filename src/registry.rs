//! Tracking sessions shared across callers, keyed by subject.
//!
//! Sessions live in a sliding-expiration [`Cache`]: every sample for a
//! subject keeps its session alive, and a subject that goes quiet for the
//! session TTL starts from scratch next time.
//!
//! Each session sits behind an async mutex, so samples for one subject are
//! applied one at a time in arrival order while different subjects advance in
//! parallel.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use log::info;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::attempt::AttemptReport;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::error::Result;
use crate::projection::Projection;
use crate::session::{GpsSample, TrackingSession};
use crate::source::SegmentSource;
use crate::{TimedPoint, TrackerConfig};

type SharedSession = Arc<Mutex<TrackingSession>>;

pub struct SessionRegistry {
    sessions: Cache<String, SharedSession>,
    source: Arc<dyn SegmentSource>,
    clock: Arc<dyn Clock>,
    projection: Arc<dyn Projection>,
    config: TrackerConfig,
}

impl SessionRegistry {
    pub fn new(
        source: Arc<dyn SegmentSource>,
        clock: Arc<dyn Clock>,
        projection: Arc<dyn Projection>,
        config: TrackerConfig,
    ) -> Self {
        let sessions = Cache::new(Duration::from_secs(config.cache_check_period_secs));
        Self {
            sessions,
            source,
            clock,
            projection,
            config,
        }
    }

    /// Feed a projected sample to `subject_id`'s session, creating it on first use.
    ///
    /// `None` only refreshes an existing session's lifetime.
    pub async fn advance(&self, subject_id: &str, point: Option<TimedPoint>) -> Result<Vec<AttemptReport>> {
        if point.is_none() {
            self.sessions.get(&subject_id.to_string());
            return Ok(Vec::new());
        }

        let session = self.session_for(subject_id).await?;
        let mut session = session.lock().await;
        session.advance(point).await
    }

    /// Feed a raw GPS sample to `subject_id`'s session.
    pub async fn advance_gps(&self, subject_id: &str, sample: Option<GpsSample>) -> Result<Vec<AttemptReport>> {
        if sample.is_none() {
            self.sessions.get(&subject_id.to_string());
            return Ok(Vec::new());
        }

        let session = self.session_for(subject_id).await?;
        let mut session = session.lock().await;
        session.advance_gps(sample).await
    }

    /// The live session for `subject_id`, if any. Refreshes its lifetime.
    pub fn session(&self, subject_id: &str) -> Option<SharedSession> {
        self.sessions.get(&subject_id.to_string())
    }

    /// Drop a subject's session immediately.
    pub fn remove(&self, subject_id: &str) {
        self.sessions.invalidate(&subject_id.to_string());
    }

    /// Number of sessions that have not expired.
    pub fn active_sessions(&self) -> usize {
        self.sessions.purge_expired();
        self.sessions.len()
    }

    /// Periodically drop expired sessions. Must be called from within a runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.sessions.spawn_sweeper()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    async fn session_for(&self, subject_id: &str) -> Result<SharedSession> {
        let builder = TrackingSession::builder(subject_id, Arc::clone(&self.source))
            .clock(Arc::clone(&self.clock))
            .projection(Arc::clone(&self.projection))
            .config(self.config.clone());
        let subject = subject_id.to_string();

        self.sessions
            .get_or_create(subject_id.to_string(), self.config.session_cache, move || {
                info!("[SessionRegistry] New tracking session for {}", subject);
                future::ready(Ok(Arc::new(Mutex::new(builder.build()))))
            })
            .await
    }
}
