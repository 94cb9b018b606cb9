use crate::types::{AnomalyInterval, Result, Taker, TakerId, TakerResultView};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Single calls against an object store (S3, MinIO, a local directory).
/// Implementations do not retry; `SegmentStore` layers the retry policy on top.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Human-readable name used in logs
    fn backend_name(&self) -> String;

    /// All keys under `prefix`, in no particular order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Write the object at `key` to `dest`
    async fn get_to_path(&self, key: &str, dest: &Path) -> Result<()>;

    /// Store the file at `src` under `key`, replacing any existing object
    async fn put_from_path(&self, src: &Path, key: &str) -> Result<()>;

    /// Deterministic public reference for `key`
    fn public_url(&self, key: &str) -> Result<String>;
}

/// Media operations needed to turn segments into one recording.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    /// Solid-colour, silent clip of `duration_secs` in the canonical encoding
    async fn synthesize_filler(&self, duration_secs: i64, output: &Path) -> Result<()>;

    /// Re-encode a device recording into the canonical encoding
    async fn normalize(&self, input: &Path, output: &Path) -> Result<()>;

    /// Join the clips listed in a concat manifest without re-encoding
    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()>;

    /// Duration of a media file in seconds
    async fn probe_duration(&self, path: &Path) -> Result<f64>;
}

#[async_trait]
pub trait TakerRepository: Send + Sync {
    async fn get_taker(&self, id: TakerId) -> Result<Taker>;

    /// Upsert; re-saving the same taker yields the same row
    async fn save_taker(&self, taker: &Taker) -> Result<()>;

    /// Returns the number of newly written records; identical records are skipped
    async fn insert_anomalies(&self, records: &[AnomalyInterval]) -> Result<usize>;

    /// Sorted by `detected_time`, latest first
    async fn list_anomalies(&self, taker_id: TakerId) -> Result<Vec<AnomalyInterval>>;

    async fn result_view(&self, taker_id: TakerId) -> Result<TakerResultView> {
        let taker = self.get_taker(taker_id).await?;
        let anomalies = self.list_anomalies(taker_id).await?;
        Ok(TakerResultView {
            taker_id,
            stored_state: taker.stored_state,
            merged_video: taker.web_cam,
            anomalies,
        })
    }
}

/// Delay policy between attempts of a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
}

impl BackoffPolicy {
    /// Delay before the attempt following `_attempt`, which counts from 1.
    pub fn delay_after(&self, _attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
        }
    }
}

/// A retryable unit of background work.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> String;

    /// `attempt` counts from 1
    async fn execute(&self, attempt: u32) -> Result<()>;

    fn max_attempts(&self) -> u32;

    fn backoff(&self) -> BackoffPolicy;
}
