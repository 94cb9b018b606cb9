#![allow(dead_code)]

use async_trait::async_trait;
use evidence_pipeline::segments::segment_key;
use evidence_pipeline::{
    ExamId, MediaEncoder, MemoryTakerRepository, ObjectBackend, PipelineError, ReassemblyContext, Result,
    SegmentStore, StoreConfig, Taker, TakerId, TakerRepository, WorkerConfig,
};
use evidence_pipeline::{MediaConfig, ReassemblyQueue};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// How a scripted call fails.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// A single network error, retried by the store
    Transient,
    NotFound,
}

impl Failure {
    fn to_error(self, key: &str) -> PipelineError {
        match self {
            Failure::Transient => PipelineError::Store(format!("connection reset while handling {}", key)),
            Failure::NotFound => PipelineError::ObjectNotFound(key.to_string()),
        }
    }
}

#[derive(Default)]
struct Script {
    failure: Option<Failure>,
    remaining: u32,
}

/// In-memory bucket with per-key scripted failures.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    get_failures: Mutex<HashMap<String, Script>>,
    put_failures: Mutex<Script>,
    list_failures: Mutex<Script>,
    get_calls: Mutex<HashMap<String, u32>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.lock().unwrap().insert(key.to_string(), body.into());
    }

    /// Stores a segment whose body records its duration, as `FakeEncoder` expects.
    pub fn insert_segment(&self, exam_id: ExamId, taker_id: TakerId, start: i64, end: i64) -> String {
        let key = segment_key(exam_id, taker_id, start, end, "webm");
        self.insert(&key, format!("duration={}\n", end - start));
        key
    }

    pub fn object(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|body| String::from_utf8_lossy(body).to_string())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// The next `times` downloads of `key` fail; `u32::MAX` fails them all.
    pub fn fail_get(&self, key: &str, failure: Failure, times: u32) {
        self.get_failures.lock().unwrap().insert(
            key.to_string(),
            Script {
                failure: Some(failure),
                remaining: times,
            },
        );
    }

    pub fn fail_put(&self, times: u32) {
        *self.put_failures.lock().unwrap() = Script {
            failure: Some(Failure::Transient),
            remaining: times,
        };
    }

    pub fn fail_list(&self, times: u32) {
        *self.list_failures.lock().unwrap() = Script {
            failure: Some(Failure::Transient),
            remaining: times,
        };
    }

    pub fn get_calls(&self, key: &str) -> u32 {
        self.get_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn take_failure(script: &mut Script, key: &str) -> Option<PipelineError> {
        match script.failure {
            Some(failure) if script.remaining > 0 => {
                if script.remaining != u32::MAX {
                    script.remaining -= 1;
                }
                Some(failure.to_error(key))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn backend_name(&self) -> String {
        "memory".to_string()
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        if let Some(e) = Self::take_failure(&mut self.list_failures.lock().unwrap(), prefix) {
            return Err(e);
        }

        // Reverse order, the store must not rely on the backend sorting
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .rev()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_to_path(&self, key: &str, dest: &Path) -> Result<()> {
        *self.get_calls.lock().unwrap().entry(key.to_string()).or_default() += 1;

        let failure = self
            .get_failures
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|script| Self::take_failure(script, key));
        if let Some(e) = failure {
            // Leave a partial file behind, like an interrupted transfer
            tokio::fs::write(dest, b"partial").await?;
            return Err(e);
        }

        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::ObjectNotFound(key.to_string()))?;
        tokio::fs::write(dest, body).await?;
        Ok(())
    }

    async fn put_from_path(&self, src: &Path, key: &str) -> Result<()> {
        if let Some(e) = Self::take_failure(&mut self.put_failures.lock().unwrap(), key) {
            return Err(e);
        }

        let body = tokio::fs::read(src).await?;
        self.insert(key, body);
        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<String> {
        Ok(format!("https://recordings.example.com/{}", key))
    }
}

fn read_duration(text: &str) -> Option<i64> {
    text.lines()
        .find_map(|line| line.strip_prefix("duration="))
        .and_then(|value| value.trim().parse().ok())
}

/// Encoder writing text descriptors instead of media.
///
/// Every clip file holds `duration=<seconds>`. A concatenated file also lists
/// the names of its clips in order on a `clips=` line.
#[derive(Default)]
pub struct FakeEncoder {
    fillers: Mutex<Vec<i64>>,
    normalize_failures: Mutex<Vec<String>>,
    concat_failures: AtomicU32,
    concat_calls: AtomicU32,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizing any input whose file name contains `pattern` fails.
    pub fn fail_normalize(&self, pattern: &str) {
        self.normalize_failures.lock().unwrap().push(pattern.to_string());
    }

    /// The next `times` concatenations fail; `u32::MAX` fails them all.
    pub fn fail_concat(&self, times: u32) {
        self.concat_failures.store(times, Ordering::SeqCst);
    }

    pub fn fillers(&self) -> Vec<i64> {
        self.fillers.lock().unwrap().clone()
    }

    pub fn concat_calls(&self) -> u32 {
        self.concat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEncoder for FakeEncoder {
    async fn synthesize_filler(&self, duration_secs: i64, output: &Path) -> Result<()> {
        self.fillers.lock().unwrap().push(duration_secs);
        tokio::fs::write(output, format!("duration={}\n", duration_secs)).await?;
        Ok(())
    }

    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        let name = input.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if self.normalize_failures.lock().unwrap().iter().any(|p| name.contains(p.as_str())) {
            return Err(PipelineError::Media(format!("cannot decode {}", name)));
        }

        let text = tokio::fs::read_to_string(input).await?;
        let duration = read_duration(&text).ok_or_else(|| PipelineError::Media(format!("no duration in {}", name)))?;
        tokio::fs::write(output, format!("duration={}\n", duration)).await?;
        Ok(())
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()> {
        self.concat_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.concat_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.concat_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(PipelineError::Media("concat demuxer failed".to_string()));
        }

        let listing = tokio::fs::read_to_string(manifest).await?;
        let mut total = 0;
        let mut names = Vec::new();

        for line in listing.lines() {
            let path = line
                .strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .ok_or_else(|| PipelineError::Media(format!("bad manifest line: {}", line)))?
                .replace(r"'\''", "'");
            let path = PathBuf::from(path);

            let text = tokio::fs::read_to_string(&path).await?;
            total += read_duration(&text).unwrap_or(0);
            names.push(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
        }

        tokio::fs::write(output, format!("duration={}\nclips={}\n", total, names.join(","))).await?;
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let text = tokio::fs::read_to_string(path).await?;
        read_duration(&text)
            .map(|d| d as f64)
            .ok_or_else(|| PipelineError::Media(format!("no duration in {}", path.display())))
    }
}

/// Clip names recorded in a concatenated descriptor.
pub fn clip_names(merged: &str) -> Vec<String> {
    merged
        .lines()
        .find_map(|line| line.strip_prefix("clips="))
        .map(|names| names.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn merged_duration(merged: &str) -> Option<i64> {
    read_duration(merged)
}

pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        max_attempts: 3,
        retry_delay_ms: 1,
        operation_timeout_seconds: 5,
        ..Default::default()
    }
}

pub fn worker_config(temp_root: &Path) -> WorkerConfig {
    WorkerConfig {
        workers: 2,
        max_retries: 2,
        retry_delay_seconds: 0,
        download_concurrency: 1,
        temp_root: temp_root.to_path_buf(),
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub encoder: Arc<FakeEncoder>,
    pub repository: Arc<MemoryTakerRepository>,
    pub context: Arc<ReassemblyContext>,
    pub temp_root: tempfile::TempDir,
}

impl Harness {
    pub async fn new(takers: Vec<Taker>) -> Self {
        Self::with_worker(takers, |_| {}).await
    }

    pub async fn with_worker(takers: Vec<Taker>, adjust: impl FnOnce(&mut WorkerConfig)) -> Self {
        let temp_root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let encoder = Arc::new(FakeEncoder::new());
        let repository = Arc::new(MemoryTakerRepository::with_takers(takers).await);

        let mut worker = worker_config(temp_root.path());
        adjust(&mut worker);

        let store = Arc::new(SegmentStore::new(backend.clone(), fast_store_config()));
        let context = Arc::new(ReassemblyContext::new(
            repository.clone(),
            store,
            encoder.clone(),
            MediaConfig::default(),
            worker,
        ));

        Self {
            backend,
            encoder,
            repository,
            context,
            temp_root,
        }
    }

    pub async fn taker(&self, id: TakerId) -> Taker {
        self.repository.get_taker(id).await.unwrap()
    }

    /// Entries left under the temp root.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.temp_root.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }
}

/// Queue that only records what was enqueued.
#[derive(Default)]
pub struct RecordingQueue {
    pub enqueued: Mutex<Vec<(TakerId, ExamId)>>,
}

impl ReassemblyQueue for RecordingQueue {
    fn enqueue_reassembly(&self, taker_id: TakerId, exam_id: ExamId) {
        self.enqueued.lock().unwrap().push((taker_id, exam_id));
    }
}
