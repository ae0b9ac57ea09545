//! Replays a synthetic ride over one segment and prints the live reports.
//!
//! Run with: `RUST_LOG=debug cargo run --example live_tracking`

use std::collections::HashMap;
use std::sync::Arc;

use segment_tracker::{
    CachedSegmentSource, ManualClock, Point, ReferenceTrace, Segment, SessionRegistry,
    StaticSegmentSource, TimedPoint, TracePoint, TrackerConfig, TrackerError,
};

#[tokio::main]
async fn main() -> Result<(), TrackerError> {
    env_logger::init();

    let config = TrackerConfig::default();

    // A 1 km climb, with a best effort of 100 s
    let segment = Segment::new(42, "Harbour Climb", Point::new(0.0, 0.0), Point::new(1000.0, 0.0), 1000.0);
    let best = ReferenceTrace::new(
        (0..=10)
            .map(|i| TracePoint::new(i as f64 * 100.0, 0.0, i as f64 * 10.0))
            .collect(),
    );
    let source = CachedSegmentSource::new(
        StaticSegmentSource::new(vec![segment], HashMap::from([(42, best)])),
        &config,
    );

    let clock = Arc::new(ManualClock::new(0.0));
    let registry = SessionRegistry::new(
        Arc::new(source),
        clock.clone(),
        Arc::new(segment_tracker::LngLatProjection),
        config,
    );

    // Slightly slower than the best effort: 90 units every 10 s
    let mut time = 0.0;
    let mut x = -20.0;
    while x < 1_100.0 {
        clock.set(time);
        let reports = registry.advance("rider", Some(TimedPoint::new(x, 0.0, time))).await?;

        for report in &reports {
            println!("{}", serde_json::to_string(report).map_err(|e| TrackerError::Internal {
                message: e.to_string(),
            })?);
        }

        x += 90.0;
        time += 10_000.0;
    }

    Ok(())
}
