use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use evidence_pipeline::segments::merged_key;
use evidence_pipeline::{
    exit_session, read_detector_output, AnomalyRecorder, DetectionConfig, FfmpegEncoder, LocalBackend, MediaConfig,
    ObjectBackend, PgTakerRepository, ReassemblyContext, ReassemblyDispatcher, S3Backend, SegmentStore, StoreConfig,
    TakerRepository, TaskQueue, TaskState, WorkerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evidence-pipeline", about = "Proctoring evidence pipeline: anomaly intervals and recording reassembly")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    media: MediaArgs,

    #[command(flatten)]
    worker: WorkerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long, env = "S3_BUCKET", default_value = "proctoring-recordings")]
    bucket: String,

    #[arg(long, env = "AWS_REGION", default_value = "ap-northeast-2")]
    region: String,

    /// Custom S3 endpoint, e.g. a MinIO server
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", default_value = "", hide_env_values = true)]
    access_key_id: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", default_value = "", hide_env_values = true)]
    secret_access_key: String,

    #[arg(long, env = "PUBLIC_BASE_URL")]
    public_base_url: Option<String>,

    /// Use a local directory instead of S3
    #[arg(long, env = "LOCAL_STORE_DIR")]
    local_store: Option<PathBuf>,

    #[arg(long, env = "STORE_MAX_ATTEMPTS", default_value_t = 5)]
    store_max_attempts: u32,
}

#[derive(Args)]
struct MediaArgs {
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    ffprobe: PathBuf,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long, env = "REASSEMBLY_WORKERS", default_value_t = 2)]
    workers: usize,

    #[arg(long, env = "REASSEMBLY_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(long, env = "REASSEMBLY_RETRY_DELAY_SECONDS", default_value_t = 300)]
    retry_delay_seconds: u64,

    #[arg(long, env = "DOWNLOAD_CONCURRENCY", default_value_t = 1)]
    download_concurrency: usize,

    #[arg(long, env = "REASSEMBLY_TEMP_DIR")]
    temp_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Reassemble one taker's recording, with retries, and wait for the result
    Reassemble { taker_id: i64, exam_id: i64 },
    /// Turn a detector JSON-lines dump into anomaly records
    Anomalies {
        taker_id: i64,
        input: PathBuf,
        #[arg(long)]
        segment_reference: Option<String>,
        #[arg(long, default_value_t = 0.5)]
        confidence_threshold: f64,
    },
    /// Check a taker out of the session and reassemble in the background
    Exit {
        taker_id: i64,
        /// e.g. 2024-11-14T10:30:00
        exit_allowed_at: NaiveDateTime,
    },
    /// Store a device recording under the session's segment naming scheme
    UploadSegment {
        exam_id: i64,
        taker_id: i64,
        start: i64,
        end: i64,
        file: PathBuf,
    },
    /// Print what the result page shows for a taker
    Result { taker_id: i64 },
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        StoreConfig {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            public_base_url: self.public_base_url.clone(),
            max_attempts: self.store_max_attempts,
            ..Default::default()
        }
    }

    fn backend(&self, config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectBackend>> {
        Ok(match &self.local_store {
            Some(dir) => {
                let mut backend = LocalBackend::new(dir);
                if let Some(base) = &self.public_base_url {
                    backend = backend.with_public_base_url(base);
                }
                Arc::new(backend)
            }
            None => Arc::new(S3Backend::new(config).context("Failed to configure S3 client")?),
        })
    }
}

impl WorkerArgs {
    fn config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            download_concurrency: self.download_concurrency,
            temp_root: self.temp_dir.clone().unwrap_or(defaults.temp_root),
        }
    }
}

fn segment_store(args: &StoreArgs) -> anyhow::Result<Arc<SegmentStore>> {
    let config = args.config();
    let backend = args.backend(&config)?;
    info!("Using object store {}", backend.backend_name());
    Ok(Arc::new(SegmentStore::new(backend, config)))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let repository = PgTakerRepository::new(&cli.database_url)
        .await
        .context("Failed to connect to database")?;

    if let Command::Migrate = cli.command {
        repository.migrate().await?;
        return Ok(());
    }

    let repository: Arc<dyn TakerRepository> = Arc::new(repository);
    let media = MediaConfig {
        ffmpeg_path: cli.media.ffmpeg.clone(),
        ffprobe_path: cli.media.ffprobe.clone(),
        ..Default::default()
    };
    let worker = cli.worker.config();

    match cli.command {
        Command::Migrate => {}
        Command::Reassemble { taker_id, exam_id } => {
            let context = Arc::new(ReassemblyContext::new(
                repository.clone(),
                segment_store(&cli.store)?,
                Arc::new(FfmpegEncoder::new(media.clone())),
                media,
                worker.clone(),
            ));
            let queue = Arc::new(TaskQueue::new(worker.workers));
            let dispatcher = ReassemblyDispatcher::new(queue.clone(), context);

            let id = dispatcher.dispatch(taker_id, exam_id)?;
            let state = queue.wait_for(id).await;
            queue.shutdown().await;

            print_json(&repository.result_view(taker_id).await?)?;
            if let Some(TaskState::FailedPermanently { attempts, error }) = state {
                bail!("reassembly of taker {} failed after {} attempts: {}", taker_id, attempts, error);
            }
        }
        Command::Anomalies {
            taker_id,
            input,
            segment_reference,
            confidence_threshold,
        } => {
            let segment_reference = match segment_reference {
                Some(reference) => reference,
                None => {
                    let taker = repository.get_taker(taker_id).await?;
                    merged_key(taker.exam_id, taker.id, &media.container_ext)
                }
            };

            let records = read_detector_output(&input).await?;
            let recorder = AnomalyRecorder::new(repository.clone())
                .with_detection_config(DetectionConfig { confidence_threshold });
            let report = recorder.record_session(taker_id, &segment_reference, records).await?;

            print_json(&report.records)?;
        }
        Command::Exit {
            taker_id,
            exit_allowed_at,
        } => {
            let context = Arc::new(ReassemblyContext::new(
                repository.clone(),
                segment_store(&cli.store)?,
                Arc::new(FfmpegEncoder::new(media.clone())),
                media,
                worker.clone(),
            ));
            let queue = Arc::new(TaskQueue::new(worker.workers));
            let dispatcher = ReassemblyDispatcher::new(queue.clone(), context);

            let now = chrono::Local::now().naive_local();
            let taker = exit_session(repository.as_ref(), &dispatcher, taker_id, now, exit_allowed_at).await?;
            info!("Taker {} checked out, waiting for background reassembly", taker.id);

            queue.shutdown().await;
        }
        Command::UploadSegment {
            exam_id,
            taker_id,
            start,
            end,
            file,
        } => {
            let ext = file
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or(&media.container_ext)
                .to_string();
            let key = segment_store(&cli.store)?
                .upload_segment(&file, exam_id, taker_id, start, end, &ext)
                .await?;
            println!("{}", key);
        }
        Command::Result { taker_id } => {
            print_json(&repository.result_view(taker_id).await?)?;
        }
    }

    Ok(())
}
