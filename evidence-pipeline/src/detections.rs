use crate::types::{Detection, FrameDetections, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// One line of detector output, either a single hit or a whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetectorRecord {
    Detection(Detection),
    Frame(FrameDetections),
}

impl DetectorRecord {
    pub fn frame_time(&self) -> i64 {
        match self {
            DetectorRecord::Detection(detection) => detection.frame_time,
            DetectorRecord::Frame(frame) => frame.frame_time,
        }
    }
}

/// Parses one line; blank lines and `#` comments yield `None`.
///
/// Frame-times count seconds from session start, so negative ones are rejected.
pub fn parse_detector_line(line: &str) -> Result<Option<DetectorRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let record: DetectorRecord = serde_json::from_str(line)?;
    if record.frame_time() < 0 {
        return Err(PipelineError::General(format!(
            "negative frame_time {}",
            record.frame_time()
        )));
    }

    Ok(Some(record))
}

/// Reads a JSON-lines detector dump, one record per line.
pub async fn read_detector_output(path: &Path) -> Result<Vec<DetectorRecord>> {
    debug!("Reading detector output from {}", path.display());

    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        match parse_detector_line(&line) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => {
                return Err(PipelineError::General(format!(
                    "{}:{}: invalid detector record: {}",
                    path.display(),
                    line_number,
                    e
                )))
            }
        }
    }

    info!("Read {} detector records from {}", records.len(), path.display());
    Ok(records)
}
