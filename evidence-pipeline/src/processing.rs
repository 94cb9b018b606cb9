use crate::segment_store::SegmentStore;
use crate::segments::SegmentKey;
use crate::traits::MediaEncoder;
use crate::types::PipelineError;
use crate::workspace::Workspace;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipKind {
    Segment { key: String },
    Filler,
}

/// A local file in the canonical encoding, covering `start..end` of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub kind: ClipKind,
    pub start: i64,
    pub end: i64,
    pub path: PathBuf,
}

impl Clip {
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_filler(&self) -> bool {
        self.kind == ClipKind::Filler
    }
}

/// Why a segment was left out of the recording.
#[derive(Debug)]
pub enum SkipReason {
    Download(PipelineError),
    Normalize(PipelineError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Download(e) => write!(f, "download failed: {}", e),
            SkipReason::Normalize(e) => write!(f, "normalize failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct SkippedSegment {
    pub key: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct GapFillOutput {
    /// Start-time ascending, fillers placed before the segment that follows the gap.
    pub clips: Vec<Clip>,
    /// Every local file created by the stage.
    pub temp_paths: Vec<PathBuf>,
    pub skipped: Vec<SkippedSegment>,
    pub malformed: Vec<String>,
}

impl GapFillOutput {
    pub fn filler_count(&self) -> usize {
        self.clips.iter().filter(|clip| clip.is_filler()).count()
    }

    pub fn segment_count(&self) -> usize {
        self.clips.len() - self.filler_count()
    }

    pub fn total_duration(&self) -> i64 {
        self.clips.iter().map(Clip::duration).sum()
    }
}

/// Result of a stage that may find nothing usable to work on.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ready(T),
    NoInput,
}

/// Turns a session listing into an ordered, gap-filled list of normalized clips.
pub struct GapFillStage {
    store: Arc<SegmentStore>,
    encoder: Arc<dyn MediaEncoder>,
    container_ext: String,
    concurrency: usize,
}

impl GapFillStage {
    pub fn new(store: Arc<SegmentStore>, encoder: Arc<dyn MediaEncoder>, container_ext: impl Into<String>) -> Self {
        Self {
            store,
            encoder,
            container_ext: container_ext.into(),
            concurrency: 1,
        }
    }

    /// Segments prepared at once; ordering of the output does not depend on it.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Parses and sorts a listing by `(start, end)`. Keys that are not webcam
    /// segments in the `ext` container are ignored; webcam keys that do not parse
    /// are returned separately.
    ///
    /// Only one container is accepted, so no two segments share offsets.
    pub fn order_segments(keys: &[String], ext: &str) -> (Vec<SegmentKey>, Vec<String>) {
        let mut segments = Vec::new();
        let mut malformed = Vec::new();

        for key in keys {
            if !SegmentKey::is_candidate(key) {
                debug!("Ignoring non-segment object {}", key);
                continue;
            }

            if !SegmentKey::has_extension(key, ext) {
                debug!("Ignoring {}: not a .{} recording", key, ext);
                continue;
            }

            match SegmentKey::parse(key) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    warn!("Skipping segment: {}", e);
                    malformed.push(key.clone());
                }
            }
        }

        segments.sort_by(|a, b| (a.start, a.end, &a.key).cmp(&(b.start, b.end, &b.key)));
        segments.dedup_by(|a, b| a.key == b.key);

        (segments, malformed)
    }

    pub async fn run(&self, keys: &[String], workspace: &mut Workspace) -> StageOutcome<GapFillOutput> {
        let (segments, malformed) = Self::order_segments(keys, &self.container_ext);
        let mut output = GapFillOutput {
            malformed,
            ..Default::default()
        };

        if segments.is_empty() {
            info!("No usable segments among {} listed objects", keys.len());
            return StageOutcome::NoInput;
        }

        let dir_buf = workspace.path().to_path_buf();
        let dir = dir_buf.as_path();
        let prepared: Vec<(Vec<PathBuf>, std::result::Result<Clip, SkipReason>)> = stream::iter(segments.clone())
            .map(move |segment| async move { self.prepare_segment(&segment, dir).await })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut previous_end: Option<i64> = None;

        for (segment, (created, result)) in segments.iter().zip(prepared) {
            for path in created {
                workspace.track(path.clone());
                output.temp_paths.push(path);
            }

            let clip = match result {
                Ok(clip) => clip,
                Err(reason) => {
                    warn!("Skipping segment {}: {}", segment.key, reason);
                    output.skipped.push(SkippedSegment {
                        key: segment.key.clone(),
                        reason,
                    });
                    continue;
                }
            };

            if let Some(previous) = previous_end.filter(|previous| clip.start > *previous) {
                if let Some(filler) = self.fill_gap(previous, clip.start, workspace).await {
                    output.temp_paths.push(filler.path.clone());
                    output.clips.push(filler);
                }
            }

            previous_end = Some(previous_end.map_or(clip.end, |previous| previous.max(clip.end)));
            output.clips.push(clip);
        }

        if output.clips.is_empty() {
            warn!("All {} segments failed, nothing to publish", segments.len());
            return StageOutcome::NoInput;
        }

        info!(
            "Prepared {} clips ({} segments, {} fillers, {} skipped), {}s total",
            output.clips.len(),
            output.segment_count(),
            output.filler_count(),
            output.skipped.len(),
            output.total_duration()
        );

        StageOutcome::Ready(output)
    }

    fn normalized_name(segment: &SegmentKey, ext: &str) -> String {
        format!("normalized_{}_{}.{}", segment.start, segment.end, ext)
    }

    async fn prepare_segment(
        &self,
        segment: &SegmentKey,
        dir: &Path,
    ) -> (Vec<PathBuf>, std::result::Result<Clip, SkipReason>) {
        let mut created = Vec::new();

        let raw = match self.store.download(&segment.key, dir).await {
            Ok(path) => path,
            Err(e) => return (created, Err(SkipReason::Download(e))),
        };
        created.push(raw.clone());

        let normalized = dir.join(Self::normalized_name(segment, &self.container_ext));
        created.push(normalized.clone());

        if let Err(e) = self.encoder.normalize(&raw, &normalized).await {
            return (created, Err(SkipReason::Normalize(e)));
        }

        // The raw recording is no longer needed once normalized
        if let Err(e) = tokio::fs::remove_file(&raw).await {
            debug!("Could not remove {} early: {}", raw.display(), e);
        }

        (
            created,
            Ok(Clip {
                kind: ClipKind::Segment {
                    key: segment.key.clone(),
                },
                start: segment.start,
                end: segment.end,
                path: normalized,
            }),
        )
    }

    async fn fill_gap(&self, from: i64, to: i64, workspace: &mut Workspace) -> Option<Clip> {
        let path = workspace.file(&format!("filler_{}_{}.{}", from, to, self.container_ext));
        debug!("Synthesizing {}s filler for gap {}..{}", to - from, from, to);

        match self.encoder.synthesize_filler(to - from, &path).await {
            Ok(()) => Some(Clip {
                kind: ClipKind::Filler,
                start: from,
                end: to,
                path,
            }),
            Err(e) => {
                warn!("Could not synthesize filler for gap {}..{}: {}", from, to, e);
                None
            }
        }
    }
}
