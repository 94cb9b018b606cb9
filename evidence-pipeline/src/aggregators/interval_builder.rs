use crate::types::{Detection, DetectionConfig, FrameDetections, RawInterval};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Turns a time-ordered detector stream into strict per-label runs.
///
/// A label seen at frame-times 5, 6, 7 and 9 yields `(5,7)` and `(9,9)`.
/// Runs separated by a missing frame are kept apart here; bridging detector
/// flicker is the merger's job.
pub struct IntervalBuilder {
    intervals: BTreeMap<String, Vec<RawInterval>>,
    confidence_threshold: f64,
    last_frame_time: Option<i64>,
    frames_seen: usize,
}

impl IntervalBuilder {
    pub fn new() -> Self {
        Self::with_config(DetectionConfig::default())
    }

    pub fn with_config(config: DetectionConfig) -> Self {
        Self {
            intervals: BTreeMap::new(),
            confidence_threshold: config.confidence_threshold,
            last_frame_time: None,
            frames_seen: 0,
        }
    }

    pub fn push_frame(&mut self, frame: &FrameDetections) {
        if !self.accept_frame_time(frame.frame_time) {
            return;
        }

        for label in &frame.labels {
            self.observe(label, frame.frame_time);
        }
    }

    pub fn push_detection(&mut self, detection: &Detection) {
        if detection.confidence < self.confidence_threshold {
            debug!(
                "Dropping {} at {}s: confidence {:.2} below {:.2}",
                detection.label, detection.frame_time, detection.confidence, self.confidence_threshold
            );
            return;
        }

        if !self.accept_frame_time(detection.frame_time) {
            return;
        }

        self.observe(&detection.label, detection.frame_time);
    }

    /// Closes every open run.
    pub fn finish(self) -> BTreeMap<String, Vec<RawInterval>> {
        debug!(
            "Built intervals for {} labels from {} frame-times",
            self.intervals.len(),
            self.frames_seen
        );
        self.intervals
    }

    fn accept_frame_time(&mut self, frame_time: i64) -> bool {
        if frame_time < 0 {
            warn!("Ignoring frame at negative time {}s", frame_time);
            return false;
        }

        match self.last_frame_time {
            Some(last) if frame_time < last => {
                warn!("Ignoring out-of-order frame at {}s (already at {}s)", frame_time, last);
                false
            }
            Some(last) if frame_time == last => true,
            _ => {
                self.last_frame_time = Some(frame_time);
                self.frames_seen += 1;
                true
            }
        }
    }

    fn observe(&mut self, label: &str, frame_time: i64) {
        let runs = self.intervals.entry(label.to_string()).or_default();

        match runs.last_mut() {
            // Many decoded frames share one frame-time
            Some(open) if open.end >= frame_time => {}
            Some(open) if open.end == frame_time - 1 => open.end = frame_time,
            _ => runs.push(RawInterval::new(label, frame_time, frame_time)),
        }
    }
}

impl Default for IntervalBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_intervals<I>(frames: I) -> BTreeMap<String, Vec<RawInterval>>
where
    I: IntoIterator<Item = FrameDetections>,
{
    let mut builder = IntervalBuilder::new();
    for frame in frames {
        builder.push_frame(&frame);
    }
    builder.finish()
}
