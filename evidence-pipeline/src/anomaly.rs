use crate::aggregators::{merge_intervals, IntervalBuilder};
use crate::detections::DetectorRecord;
use crate::traits::TakerRepository;
use crate::types::{AnomalyInterval, DetectionConfig, RawInterval, Result, TakerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub records: Vec<AnomalyInterval>,
    pub rejected: Vec<RawInterval>,
    pub written: usize,
}

/// Merges raw runs into anomaly records and persists them for one taker.
pub struct AnomalyRecorder {
    repository: Arc<dyn TakerRepository>,
    detection: DetectionConfig,
}

impl AnomalyRecorder {
    pub fn new(repository: Arc<dyn TakerRepository>) -> Self {
        Self { repository, detection: DetectionConfig::default() }
    }

    pub fn with_detection_config(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    /// Pure part of the merger: same input, same records.
    ///
    /// Runs whose merged span is empty or inverted are returned as rejected,
    /// never adjusted.
    pub fn build_records(
        taker_id: TakerId,
        segment_reference: &str,
        raw: &BTreeMap<String, Vec<RawInterval>>,
    ) -> (Vec<AnomalyInterval>, Vec<RawInterval>) {
        let mut records = Vec::new();
        let mut rejected = Vec::new();

        for (label, intervals) in raw {
            for merged in merge_intervals(intervals) {
                match AnomalyInterval::from_seconds(taker_id, &merged, segment_reference) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!("Rejected {} interval for taker {}: {}", label, taker_id, e);
                        rejected.push(merged);
                    }
                }
            }
        }

        (records, rejected)
    }

    pub async fn record(
        &self,
        taker_id: TakerId,
        segment_reference: &str,
        raw: &BTreeMap<String, Vec<RawInterval>>,
    ) -> Result<MergeReport> {
        let (records, rejected) = Self::build_records(taker_id, segment_reference, raw);

        for record in &records {
            info!(
                "Saving anomaly: label={}, start={}, end={}, taker={}",
                record.label, record.detected_time, record.end_time, taker_id
            );
        }

        let written = self.repository.insert_anomalies(&records).await?;

        info!(
            "Recorded {} anomaly intervals for taker {} ({} new, {} rejected)",
            records.len(),
            taker_id,
            written,
            rejected.len()
        );

        Ok(MergeReport { records, rejected, written })
    }

    /// Runs builder and merger over a whole detector stream for one session.
    pub async fn record_session<I>(&self, taker_id: TakerId, segment_reference: &str, stream: I) -> Result<MergeReport>
    where
        I: IntoIterator<Item = DetectorRecord>,
    {
        let mut builder = IntervalBuilder::with_config(self.detection);
        for record in stream {
            match record {
                DetectorRecord::Frame(frame) => builder.push_frame(&frame),
                DetectorRecord::Detection(detection) => builder.push_detection(&detection),
            }
        }

        self.record(taker_id, segment_reference, &builder.finish()).await
    }
}
