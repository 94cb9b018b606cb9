use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub type TakerId = i64;
pub type ExamId = i64;

/// One detected object in one processed frame, as reported by the detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Whole seconds since session start.
    pub frame_time: i64,
    pub confidence: f64,
}

impl Detection {
    /// Adapts a detector hit reported at a millisecond position in the recording.
    pub fn at_position_ms(label: impl Into<String>, position_ms: f64, confidence: f64) -> Self {
        Self {
            label: label.into(),
            frame_time: (position_ms / 1000.0).floor() as i64,
            confidence,
        }
    }
}

/// All labels seen in one frame-time. This is the detector output contract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub frame_time: i64,
    pub labels: BTreeSet<String>,
}

impl FrameDetections {
    pub fn new<I, S>(frame_time: i64, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frame_time,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot complete reassembly from state {from}")]
    NotInProgress { from: StoredState },

    #[error("unknown state value: {0}")]
    UnknownState(String),

    #[error("exit is not allowed before {allowed_at}")]
    ExitTooEarly { allowed_at: NaiveDateTime },
}

/// Progress of the reassembly pipeline for one taker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredState {
    #[default]
    Before,
    InProgress,
    Done,
}

impl StoredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoredState::Before => "before",
            StoredState::InProgress => "in_progress",
            StoredState::Done => "done",
        }
    }

    /// A reassembly run started. Re-runs start from any state.
    pub fn begin(self) -> StoredState {
        StoredState::InProgress
    }

    /// A run published its artifact. `Done -> Done` is a re-run overwriting the artifact.
    pub fn finish(self) -> Result<StoredState, TransitionError> {
        match self {
            StoredState::InProgress | StoredState::Done => Ok(StoredState::Done),
            StoredState::Before => Err(TransitionError::NotInProgress { from: self }),
        }
    }
}

impl fmt::Display for StoredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoredState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(StoredState::Before),
            "in_progress" => Ok(StoredState::InProgress),
            "done" => Ok(StoredState::Done),
            other => Err(TransitionError::UnknownState(other.to_owned())),
        }
    }
}

/// Whether the taker left the session properly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutState {
    #[default]
    Abnormal,
    Normal,
}

impl CheckOutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutState::Abnormal => "abnormal",
            CheckOutState::Normal => "normal",
        }
    }

    /// Exiting becomes a proper check-out only once the exam's exit time has passed.
    pub fn check_out(self, now: NaiveDateTime, exit_allowed_at: NaiveDateTime) -> Result<CheckOutState, TransitionError> {
        if now < exit_allowed_at {
            return Err(TransitionError::ExitTooEarly { allowed_at: exit_allowed_at });
        }
        Ok(CheckOutState::Normal)
    }
}

impl fmt::Display for CheckOutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckOutState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abnormal" => Ok(CheckOutState::Abnormal),
            "normal" => Ok(CheckOutState::Normal),
            other => Err(TransitionError::UnknownState(other.to_owned())),
        }
    }
}

// Object style note:
// Implementations of this trait hand the work to a background worker and
// return immediately. The caller (the exit request) never observes the
// outcome; progress is only visible through the taker's stored state.

pub trait ReassemblyQueue {
    fn enqueue_reassembly(&self, taker_id: TakerId, exam_id: ExamId);
}
