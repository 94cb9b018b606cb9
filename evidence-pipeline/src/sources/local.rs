use crate::traits::ObjectBackend;
use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// A directory standing in for a bucket, keys map to relative paths.
pub struct LocalBackend {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(PipelineError::Store(format!("key escapes the store root: {}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn backend_name(&self) -> String {
        format!("local://{}", self.root.display())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(keys);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    async fn get_to_path(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(key)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(PipelineError::ObjectNotFound(key.to_string()));
        }

        tokio::fs::copy(&src, dest).await?;
        debug!("Copied {} to {}", src.display(), dest.display());
        Ok(())
    }

    async fn put_from_path(&self, src: &Path, key: &str) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::copy(src, &dest).await?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<String> {
        match &self.public_base_url {
            Some(base) => Ok(Url::parse(&format!("{}/{}", base.trim_end_matches('/'), key))?.to_string()),
            None => {
                let path = std::path::absolute(self.object_path(key)?)?;
                Url::from_file_path(&path)
                    .map(|url| url.to_string())
                    .map_err(|_| PipelineError::General(format!("not an absolute path: {}", path.display())))
            }
        }
    }
}
