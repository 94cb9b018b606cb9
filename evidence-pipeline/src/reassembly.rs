use crate::pipeline::{TaskId, TaskQueue};
use crate::processing::{GapFillStage, StageOutcome};
use crate::publish::{PublishStage, PublishedArtifact};
use crate::segment_store::SegmentStore;
use crate::segments::session_prefix;
use crate::traits::{BackoffPolicy, MediaEncoder, Task, TakerRepository};
use crate::types::{ExamId, MediaConfig, ReassemblyQueue, Result, Taker, TakerId, WorkerConfig};
use crate::workspace::Workspace;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything a reassembly run needs, shared by all runs.
pub struct ReassemblyContext {
    pub repository: Arc<dyn TakerRepository>,
    pub store: Arc<SegmentStore>,
    pub encoder: Arc<dyn MediaEncoder>,
    pub media: MediaConfig,
    pub worker: WorkerConfig,
}

impl ReassemblyContext {
    pub fn new(
        repository: Arc<dyn TakerRepository>,
        store: Arc<SegmentStore>,
        encoder: Arc<dyn MediaEncoder>,
        media: MediaConfig,
        worker: WorkerConfig,
    ) -> Self {
        Self {
            repository,
            store,
            encoder,
            media,
            worker,
        }
    }

    fn gap_fill_stage(&self) -> GapFillStage {
        GapFillStage::new(self.store.clone(), self.encoder.clone(), self.media.container_ext.clone())
            .with_concurrency(self.worker.download_concurrency)
    }

    fn publish_stage(&self) -> PublishStage {
        PublishStage::new(
            self.store.clone(),
            self.encoder.clone(),
            self.repository.clone(),
            self.media.container_ext.clone(),
            self.media.duration_tolerance_seconds,
        )
    }
}

#[derive(Debug, Clone)]
pub enum ReassemblyOutcome {
    Published(PublishedArtifact),
    /// Nothing usable was stored for the session; not an error and not retried.
    NoInput,
}

/// One taker's reassembly: list, gap-fill, publish.
pub struct ReassemblyTask {
    context: Arc<ReassemblyContext>,
    taker_id: TakerId,
    exam_id: ExamId,
}

impl ReassemblyTask {
    pub fn new(context: Arc<ReassemblyContext>, taker_id: TakerId, exam_id: ExamId) -> Self {
        Self {
            context,
            taker_id,
            exam_id,
        }
    }

    /// A single attempt. The workspace is removed on every exit path.
    pub async fn run_once(&self) -> Result<ReassemblyOutcome> {
        let repository = &self.context.repository;

        let taker = repository.get_taker(self.taker_id).await?;
        if taker.exam_id != self.exam_id {
            warn!(
                "Taker {} belongs to exam {}, reassembling under exam {} as requested",
                self.taker_id, taker.exam_id, self.exam_id
            );
        }

        let taker = taker.start_reassembly();
        repository.save_taker(&taker).await?;

        let mut workspace = Workspace::create(&self.context.worker.temp_root, self.exam_id, self.taker_id).await?;
        let result = self.run_stages(&mut workspace).await;
        workspace.cleanup().await;

        result
    }

    async fn run_stages(&self, workspace: &mut Workspace) -> Result<ReassemblyOutcome> {
        let prefix = session_prefix(self.exam_id, self.taker_id);
        info!("Looking for segments under {}", prefix);

        let keys = self.context.store.list(&prefix).await?;
        if keys.is_empty() {
            warn!("No recordings stored for taker {} in exam {}", self.taker_id, self.exam_id);
            return Ok(ReassemblyOutcome::NoInput);
        }

        let prepared = match self.context.gap_fill_stage().run(&keys, workspace).await {
            StageOutcome::Ready(prepared) => prepared,
            StageOutcome::NoInput => {
                warn!("No segment of taker {} could be processed", self.taker_id);
                return Ok(ReassemblyOutcome::NoInput);
            }
        };

        let (_, artifact) = self
            .context
            .publish_stage()
            .run(self.taker_id, self.exam_id, &prepared.clips, workspace)
            .await?;

        Ok(ReassemblyOutcome::Published(artifact))
    }
}

#[async_trait]
impl Task for ReassemblyTask {
    fn name(&self) -> String {
        format!("reassembly(taker={}, exam={})", self.taker_id, self.exam_id)
    }

    async fn execute(&self, attempt: u32) -> Result<()> {
        match self.run_once().await {
            Ok(ReassemblyOutcome::Published(artifact)) => {
                info!(
                    "Taker {} reassembled on attempt {}: {} clips, {}s",
                    self.taker_id, attempt, artifact.clip_count, artifact.expected_duration
                );
                Ok(())
            }
            Ok(ReassemblyOutcome::NoInput) => {
                info!("Taker {} has nothing to reassemble", self.taker_id);
                Ok(())
            }
            Err(e) => {
                error!("Reassembly of taker {} failed on attempt {}: {}", self.taker_id, attempt, e);
                Err(e)
            }
        }
    }

    fn max_attempts(&self) -> u32 {
        self.context.worker.max_attempts()
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::Fixed(self.context.worker.retry_delay())
    }
}

/// Hands reassembly runs to a `TaskQueue`.
pub struct ReassemblyDispatcher {
    queue: Arc<TaskQueue>,
    context: Arc<ReassemblyContext>,
}

impl ReassemblyDispatcher {
    pub fn new(queue: Arc<TaskQueue>, context: Arc<ReassemblyContext>) -> Self {
        Self { queue, context }
    }

    pub fn dispatch(&self, taker_id: TakerId, exam_id: ExamId) -> Result<TaskId> {
        let task = ReassemblyTask::new(self.context.clone(), taker_id, exam_id);
        self.queue.submit(Arc::new(task))
    }
}

impl ReassemblyQueue for ReassemblyDispatcher {
    fn enqueue_reassembly(&self, taker_id: TakerId, exam_id: ExamId) {
        match self.dispatch(taker_id, exam_id) {
            Ok(id) => info!("Reassembly of taker {} queued as {}", taker_id, id),
            Err(e) => error!("Could not queue reassembly of taker {}: {}", taker_id, e),
        }
    }
}

/// Ends a taker's session: a proper check-out, then reassembly in the background.
///
/// An exit before `exit_allowed_at` is rejected and nothing is queued.
pub async fn exit_session(
    repository: &dyn TakerRepository,
    queue: &(dyn ReassemblyQueue + Sync),
    taker_id: TakerId,
    now: NaiveDateTime,
    exit_allowed_at: NaiveDateTime,
) -> Result<Taker> {
    let taker = repository.get_taker(taker_id).await?;
    let taker = taker.check_out(now, exit_allowed_at)?;
    repository.save_taker(&taker).await?;

    info!("Taker {} checked out of exam {}", taker.id, taker.exam_id);
    queue.enqueue_reassembly(taker.id, taker.exam_id);

    Ok(taker)
}
