pub mod types;
pub mod traits;
pub mod aggregators;
pub mod anomaly;
pub mod detections;
pub mod segments;
pub mod segment_store;
pub mod sources;
pub mod media;
pub mod workspace;
pub mod processing;
pub mod publish;
pub mod pipeline;
pub mod reassembly;
pub mod repository;

pub use types::*;
pub use aggregators::{merge_intervals, IntervalBuilder};
pub use anomaly::{AnomalyRecorder, MergeReport};
pub use detections::{read_detector_output, DetectorRecord};
pub use media::FfmpegEncoder;
pub use pipeline::{TaskId, TaskQueue, TaskState};
pub use processing::{Clip, ClipKind, GapFillOutput, GapFillStage, SkipReason, StageOutcome};
pub use publish::{PublishStage, PublishedArtifact};
pub use reassembly::{exit_session, ReassemblyContext, ReassemblyDispatcher, ReassemblyOutcome, ReassemblyTask};
pub use repository::{MemoryTakerRepository, PgTakerRepository};
pub use segment_store::SegmentStore;
pub use sources::{LocalBackend, S3Backend};
pub use traits::{BackoffPolicy, MediaEncoder, ObjectBackend, Task, TakerRepository};
pub use workspace::Workspace;
