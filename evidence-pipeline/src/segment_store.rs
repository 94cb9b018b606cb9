use crate::segments::{segment_key, SegmentKey};
use crate::traits::ObjectBackend;
use crate::types::{ExamId, PipelineError, Result, StoreConfig, TakerId};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lists, downloads and uploads session objects with a bounded retry per call.
///
/// The retry here only covers transient I/O of a single call. It is
/// independent of the task-level retry in the worker queue.
pub struct SegmentStore {
    backend: Arc<dyn ObjectBackend>,
    config: StoreConfig,
}

impl SegmentStore {
    pub fn new(backend: Arc<dyn ObjectBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend_name(&self) -> String {
        self.backend.backend_name()
    }

    /// Keys under `prefix`, sorted and de-duplicated.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let backend = self.backend.as_ref();
        let mut keys = self.with_retry("list", prefix, move || backend.list_keys(prefix)).await?;

        keys.sort();
        keys.dedup();

        debug!("Listed {} objects under {} ({})", keys.len(), prefix, self.backend_name());
        Ok(keys)
    }

    /// Downloads `key` into `dest_dir` and returns the local path.
    ///
    /// The caller owns the returned file. A failed download leaves nothing behind.
    pub async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = key
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PipelineError::General(format!("key has no file name: {}", key)))?;
        let dest = dest_dir.join(file_name);

        let backend = self.backend.as_ref();
        let dest_path = dest.as_path();
        let result = self
            .with_retry("download", key, move || backend.get_to_path(key, dest_path))
            .await;

        if let Err(e) = result {
            if let Err(remove_err) = tokio::fs::remove_file(&dest).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove partial download {}: {}", dest.display(), remove_err);
                }
            }
            return Err(e);
        }

        debug!("Downloaded {} to {}", key, dest.display());
        Ok(dest)
    }

    pub async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let backend = self.backend.as_ref();
        self.with_retry("upload", key, move || backend.put_from_path(local_path, key))
            .await?;

        info!("Uploaded {} to {}", local_path.display(), key);
        Ok(())
    }

    /// Stores a device recording under the session's segment naming scheme.
    pub async fn upload_segment(
        &self,
        local_path: &Path,
        exam_id: ExamId,
        taker_id: TakerId,
        start: i64,
        end: i64,
        ext: &str,
    ) -> Result<String> {
        let key = segment_key(exam_id, taker_id, start, end, ext);
        SegmentKey::parse(&key)?;

        self.upload(local_path, &key).await?;
        Ok(key)
    }

    pub fn public_url(&self, key: &str) -> Result<String> {
        self.backend.public_url(key)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let initial = Duration::from_millis(self.config.retry_delay_ms);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: initial * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let max_attempts = self.config.max_attempts.max(1);
        let call_timeout = Duration::from_secs(self.config.operation_timeout_seconds);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let outcome = match tokio::time::timeout(call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PipelineError::Store(format!(
                    "{} {} timed out after {:?}",
                    operation, key, call_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} {} succeeded on attempt {}", operation, key, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        let delay = backoff.next_backoff().unwrap_or(initial);
                        warn!(
                            "Attempt {} to {} {} failed: {}, retrying in {:?}",
                            attempt, operation, key, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        error!("Failed to {} {} after {} attempts: {}", operation, key, max_attempts, message);

        Err(PipelineError::StoreUnavailable {
            attempts: max_attempts,
            message,
        })
    }
}
