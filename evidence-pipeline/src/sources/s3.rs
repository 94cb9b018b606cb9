//! S3 / MinIO backend for session recordings.

use crate::traits::ObjectBackend;
use crate::types::{PipelineError, Result, StoreConfig};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{retry::RetryConfig, timeout::TimeoutConfig, Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

pub struct S3Backend {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
    public_base_url: Option<String>,
}

impl S3Backend {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(PipelineError::Config("S3 bucket name is empty".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "evidence-pipeline",
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .read_timeout(Duration::from_secs(config.read_timeout_seconds))
            .build();

        // SegmentStore owns the retry policy
        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(timeouts)
            .behavior_version_latest();

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for MinIO
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            public_base_url: config.public_base_url.clone(),
        })
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Public reference of an object, from the configured base URL or the bucket's S3 address.
pub fn object_url(
    bucket: &str,
    region: &str,
    endpoint: Option<&str>,
    public_base_url: Option<&str>,
    key: &str,
) -> Result<String> {
    let raw = match (public_base_url, endpoint) {
        (Some(base), _) => format!("{}/{}", base.trim_end_matches('/'), key),
        (None, Some(endpoint)) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
        (None, None) => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key),
    };

    Ok(Url::parse(&raw)?.to_string())
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn backend_name(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| PipelineError::Store(DisplayErrorContext(&e).to_string()))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(std::string::ToString::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn get_to_path(&self, key: &str, dest: &Path) -> Result<()> {
        let mut response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service_error) if service_error.is_no_such_key() => {
                    PipelineError::ObjectNotFound(key.to_string())
                }
                _ => PipelineError::Store(DisplayErrorContext(&e).to_string()),
            })?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| PipelineError::Store(format!("reading {}: {}", key, e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("Fetched s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn put_from_path(&self, src: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| PipelineError::Store(format!("reading {}: {}", src.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(src))
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Store(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<String> {
        object_url(
            &self.bucket,
            &self.region,
            self.endpoint.as_deref(),
            self.public_base_url.as_deref(),
            key,
        )
    }
}
