use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
// Boundary types shared with the web layer and the detector integration
pub use interfaces::defs::{CheckOutState, Detection, ExamId, FrameDetections, ReassemblyQueue, StoredState, TakerId, TransitionError};

/// A maximal run of consecutive frame-times in which `label` was detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInterval {
    pub label: String,
    pub start: i64,
    pub end: i64,
}

impl RawInterval {
    pub fn new(label: impl Into<String>, start: i64, end: i64) -> Self {
        Self { label: label.into(), start, end }
    }
}

/// A persisted merged run of one label (the "Abnormal" record).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AnomalyInterval {
    pub taker_id: TakerId,
    pub label: String,
    pub detected_time: NaiveTime,
    pub end_time: NaiveTime,
    pub segment_reference: String,
}

impl AnomalyInterval {
    pub fn try_new(
        taker_id: TakerId,
        label: impl Into<String>,
        detected_time: NaiveTime,
        end_time: NaiveTime,
        segment_reference: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        if detected_time >= end_time {
            return Err(PipelineError::InvalidInterval {
                label,
                start: detected_time.num_seconds_from_midnight() as i64,
                end: end_time.num_seconds_from_midnight() as i64,
            });
        }

        Ok(Self {
            taker_id,
            label,
            detected_time,
            end_time,
            segment_reference: segment_reference.into(),
        })
    }

    /// Builds a record from session-relative seconds.
    pub fn from_seconds(taker_id: TakerId, interval: &RawInterval, segment_reference: &str) -> Result<Self> {
        if interval.start >= interval.end {
            return Err(PipelineError::InvalidInterval {
                label: interval.label.clone(),
                start: interval.start,
                end: interval.end,
            });
        }

        Self::try_new(
            taker_id,
            interval.label.clone(),
            seconds_to_time_of_day(interval.start)?,
            seconds_to_time_of_day(interval.end)?,
            segment_reference,
        )
    }
}

/// Session-relative seconds as a time of day, e.g. 3725 -> 01:02:05.
pub fn seconds_to_time_of_day(seconds: i64) -> Result<NaiveTime> {
    u32::try_from(seconds)
        .ok()
        .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, 0))
        .ok_or_else(|| PipelineError::General(format!("offset {}s does not fit in a day", seconds)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taker {
    pub id: TakerId,
    pub exam_id: ExamId,
    pub check_out_state: CheckOutState,
    pub stored_state: StoredState,
    /// Public reference of the merged recording, once published.
    pub web_cam: Option<String>,
}

impl Taker {
    pub fn new(id: TakerId, exam_id: ExamId) -> Self {
        Self {
            id,
            exam_id,
            check_out_state: CheckOutState::default(),
            stored_state: StoredState::default(),
            web_cam: None,
        }
    }

    pub fn start_reassembly(self) -> Self {
        Self { stored_state: self.stored_state.begin(), ..self }
    }

    pub fn complete_reassembly(self, merged_video: String) -> Result<Self> {
        let stored_state = self.stored_state.finish()?;
        Ok(Self { stored_state, web_cam: Some(merged_video), ..self })
    }

    pub fn check_out(self, now: chrono::NaiveDateTime, exit_allowed_at: chrono::NaiveDateTime) -> Result<Self> {
        let check_out_state = self.check_out_state.check_out(now, exit_allowed_at)?;
        Ok(Self { check_out_state, ..self })
    }
}

/// What the web layer reads for a taker's result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakerResultView {
    pub taker_id: TakerId,
    pub stored_state: StoredState,
    pub merged_video: Option<String>,
    /// Sorted by `detected_time`, latest first.
    pub anomalies: Vec<AnomalyInterval>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for MinIO, `None` for AWS S3
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Overrides the virtual-hosted S3 URL when computing public references
    pub public_base_url: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: "proctoring-recordings".to_string(),
            region: "ap-northeast-2".to_string(),
            endpoint: None,
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            public_base_url: None,
            max_attempts: 5,
            retry_delay_ms: 200,
            connect_timeout_seconds: 5,
            read_timeout_seconds: 10,
            operation_timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub crf: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub container_ext: String,
    pub filler_color: String,
    pub timeout_seconds: u64,
    /// Allowed drift between the merged duration and the sum of its clips
    pub duration_tolerance_seconds: f64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            width: 1280,
            height: 720,
            frame_rate: 30,
            video_codec: "libvpx".to_string(),
            audio_codec: "libvorbis".to_string(),
            crf: 23,
            video_bitrate: "2000k".to_string(),
            audio_bitrate: "192k".to_string(),
            sample_rate: 44100,
            container_ext: "webm".to_string(),
            filler_color: "black".to_string(),
            timeout_seconds: 1800,
            duration_tolerance_seconds: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub download_concurrency: usize,
    pub temp_root: PathBuf,
}

impl WorkerConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 3,
            retry_delay_seconds: 5 * 60,
            download_concurrency: 1,
            temp_root: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionConfig {
    pub confidence_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { confidence_threshold: 0.5 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Object store unavailable after {attempts} attempts: {message}")]
    StoreUnavailable { attempts: u32, message: String },

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Malformed segment key: {0}")]
    MalformedSegment(String),

    #[error("Invalid interval for {label}: start {start} is not before end {end}")]
    InvalidInterval { label: String, start: i64, end: i64 },

    #[error("Media error: {0}")]
    Media(String),

    #[error("Taker not found: {id}")]
    TakerNotFound { id: TakerId },

    #[error("State transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

impl PipelineError {
    /// Errors worth repeating a single store call for.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Store(_) | PipelineError::Io(_))
    }

    /// Errors that justify re-running a whole task.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::TakerNotFound { .. }
                | PipelineError::MalformedSegment(_)
                | PipelineError::InvalidInterval { .. }
                | PipelineError::Transition(_)
                | PipelineError::InvalidUrl(_)
                | PipelineError::Config(_)
                | PipelineError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
