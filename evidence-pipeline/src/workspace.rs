use crate::types::{ExamId, Result, TakerId};
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use uuid::Uuid;

/// Scratch directory owned by one reassembly attempt.
///
/// The directory name carries the exam and taker ids plus a random suffix, so
/// concurrent runs never share files. Every file created during the attempt is
/// tracked and removed by `cleanup`, which logs failures instead of returning them.
pub struct Workspace {
    root: PathBuf,
    tracked: Vec<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    pub async fn create(temp_root: &Path, exam_id: ExamId, taker_id: TakerId) -> Result<Self> {
        let root = temp_root.join(format!("reassembly-{}-{}-{}", exam_id, taker_id, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&root).await?;
        debug!("Created workspace {}", root.display());

        Ok(Self {
            root,
            tracked: Vec::new(),
            cleaned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path for a new file inside the workspace, tracked for cleanup.
    pub fn file(&mut self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        self.track(path.clone());
        path
    }

    pub fn track(&mut self, path: PathBuf) {
        if !self.tracked.contains(&path) {
            self.tracked.push(path);
        }
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    /// Removes every tracked file and the directory itself. Returns the number of files removed.
    pub async fn cleanup(mut self) -> usize {
        self.cleaned = true;
        let mut removed = 0;

        for path in &self.tracked {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove workspace {}: {}", self.root.display(), e),
        }

        debug!("Cleaned workspace {} ({} files)", self.root.display(), removed);
        removed
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("Failed to remove abandoned workspace {}: {}", self.root.display(), e);
                }
            }
        }
    }
}
