use crate::media::write_concat_manifest;
use crate::processing::Clip;
use crate::segment_store::SegmentStore;
use crate::segments::merged_key;
use crate::traits::{MediaEncoder, TakerRepository};
use crate::types::{ExamId, PipelineError, Result, Taker, TakerId};
use crate::workspace::Workspace;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub key: String,
    pub url: String,
    pub clip_count: usize,
    /// Sum of clip durations in seconds
    pub expected_duration: i64,
    /// Measured on the concatenated file, `None` if probing failed
    pub probed_duration: Option<f64>,
}

/// Concatenates prepared clips, uploads the result and records it on the taker.
pub struct PublishStage {
    store: Arc<SegmentStore>,
    encoder: Arc<dyn MediaEncoder>,
    repository: Arc<dyn TakerRepository>,
    container_ext: String,
    duration_tolerance: f64,
}

impl PublishStage {
    pub fn new(
        store: Arc<SegmentStore>,
        encoder: Arc<dyn MediaEncoder>,
        repository: Arc<dyn TakerRepository>,
        container_ext: impl Into<String>,
        duration_tolerance: f64,
    ) -> Self {
        Self {
            store,
            encoder,
            repository,
            container_ext: container_ext.into(),
            duration_tolerance,
        }
    }

    pub async fn run(
        &self,
        taker_id: TakerId,
        exam_id: ExamId,
        clips: &[Clip],
        workspace: &mut Workspace,
    ) -> Result<(Taker, PublishedArtifact)> {
        if clips.is_empty() {
            return Err(PipelineError::Media("no clips to concatenate".to_string()));
        }

        let manifest = workspace.file("concat.txt");
        let output = workspace.file(&format!("merged.{}", self.container_ext));

        let paths: Vec<_> = clips.iter().map(|clip| clip.path.clone()).collect();
        write_concat_manifest(&manifest, &paths).await?;
        self.encoder.concat(&manifest, &output).await?;

        let expected_duration: i64 = clips.iter().map(Clip::duration).sum();
        let probed_duration = match self.encoder.probe_duration(&output).await {
            Ok(duration) => {
                if (duration - expected_duration as f64).abs() > self.duration_tolerance {
                    warn!(
                        "Merged recording for taker {} lasts {:.1}s, expected {}s",
                        taker_id, duration, expected_duration
                    );
                }
                Some(duration)
            }
            Err(e) => {
                warn!("Could not probe merged recording for taker {}: {}", taker_id, e);
                None
            }
        };

        let key = merged_key(exam_id, taker_id, &self.container_ext);
        self.store.upload(&output, &key).await?;
        let url = self.store.public_url(&key)?;

        // Re-read so a check-out that happened meanwhile is not overwritten
        let taker = self.repository.get_taker(taker_id).await?;
        let taker = taker.complete_reassembly(url.clone())?;
        self.repository.save_taker(&taker).await?;

        info!("Published merged recording for taker {} at {}", taker_id, url);

        Ok((
            taker,
            PublishedArtifact {
                key,
                url,
                clip_count: clips.len(),
                expected_duration,
                probed_duration,
            },
        ))
    }
}
