use crate::traits::MediaEncoder;
use crate::types::{MediaConfig, PipelineError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 12;

/// Renders an ffmpeg concat-demuxer manifest, one `file '<path>'` line per clip.
pub fn render_concat_manifest(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|clip| {
            let path = clip.to_string_lossy().replace('\\', "/").replace('\'', r"'\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

pub async fn write_concat_manifest(manifest: &Path, clips: &[PathBuf]) -> Result<()> {
    tokio::fs::write(manifest, render_concat_manifest(clips)).await?;
    debug!("Wrote concat manifest {} with {} clips", manifest.display(), clips.len());
    Ok(())
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Encodes through the `ffmpeg` and `ffprobe` binaries.
pub struct FfmpegEncoder {
    config: MediaConfig,
}

impl FfmpegEncoder {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Canonical output encoding shared by fillers and normalized segments,
    /// so the concat step can copy streams.
    fn canonical_args(&self) -> Vec<OsString> {
        let c = &self.config;
        [
            "-c:v".to_string(),
            c.video_codec.clone(),
            "-crf".to_string(),
            c.crf.to_string(),
            "-b:v".to_string(),
            c.video_bitrate.clone(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-r".to_string(),
            c.frame_rate.to_string(),
            "-c:a".to_string(),
            c.audio_codec.clone(),
            "-b:a".to_string(),
            c.audio_bitrate.clone(),
            "-ar".to_string(),
            c.sample_rate.to_string(),
            "-ac".to_string(),
            "2".to_string(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }

    async fn run(&self, program: &Path, args: Vec<OsString>, what: &str) -> Result<Output> {
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} for {}: {:?}", program.display(), what, command);

        let limit = Duration::from_secs(self.config.timeout_seconds);
        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| PipelineError::Media(format!("{} timed out after {:?}", what, limit)))?
            .map_err(|e| PipelineError::Media(format!("failed to start {}: {}", program.display(), e)))?;

        if !output.status.success() {
            return Err(PipelineError::Media(format!(
                "{} failed ({}): {}",
                what,
                output.status,
                stderr_tail(&output)
            )));
        }

        Ok(output)
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>, what: &str) -> Result<()> {
        let mut full_args: Vec<OsString> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];
        full_args.extend(args);
        self.run(&self.config.ffmpeg_path, full_args, what).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn synthesize_filler(&self, duration_secs: i64, output: &Path) -> Result<()> {
        if duration_secs <= 0 {
            return Err(PipelineError::Media(format!(
                "filler duration must be positive, got {}s",
                duration_secs
            )));
        }

        let c = &self.config;
        let video = format!(
            "color=c={}:s={}x{}:r={}:d={}",
            c.filler_color, c.width, c.height, c.frame_rate, duration_secs
        );
        let audio = format!("anullsrc=r={}:cl=stereo", c.sample_rate);

        let mut args: Vec<OsString> = vec![
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            video.into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            audio.into(),
            "-t".into(),
            duration_secs.to_string().into(),
        ];
        args.extend(self.canonical_args());
        args.push(output.as_os_str().to_owned());

        self.run_ffmpeg(args, &format!("filler of {}s", duration_secs)).await
    }

    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        let c = &self.config;
        let scale = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1",
            w = c.width,
            h = c.height
        );

        let mut args: Vec<OsString> = vec!["-i".into(), input.as_os_str().to_owned(), "-vf".into(), scale.into()];
        args.extend(self.canonical_args());
        args.push(output.as_os_str().to_owned());

        self.run_ffmpeg(args, &format!("normalize {}", input.display())).await
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            manifest.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            output.as_os_str().to_owned(),
        ];

        self.run_ffmpeg(args, "concat").await
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path.as_os_str().to_owned(),
        ];

        let output = self
            .run(&self.config.ffprobe_path, args, &format!("probe {}", path.display()))
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| PipelineError::Media(format!("unreadable duration for {}: {:?}", path.display(), stdout.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lists_clips_in_order() {
        let manifest = render_concat_manifest(&[PathBuf::from("/tmp/a.webm"), PathBuf::from("/tmp/b.webm")]);
        assert_eq!(manifest, "file '/tmp/a.webm'\nfile '/tmp/b.webm'\n");
    }

    #[test]
    fn test_manifest_escapes_quotes_and_separators() {
        let manifest = render_concat_manifest(&[PathBuf::from(r"C:\work\taker's clip.webm")]);
        assert_eq!(manifest, "file 'C:/work/taker'\\''s clip.webm'\n");
    }

    #[tokio::test]
    async fn test_filler_rejects_empty_duration() {
        let encoder = FfmpegEncoder::new(MediaConfig::default());
        let result = encoder.synthesize_filler(0, Path::new("/tmp/never.webm")).await;
        assert!(matches!(result, Err(PipelineError::Media(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_media_error() {
        let encoder = FfmpegEncoder::new(MediaConfig {
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
            ..Default::default()
        });
        let result = encoder.probe_duration(Path::new("/tmp/never.webm")).await;
        assert!(matches!(result, Err(PipelineError::Media(_))));
    }
}
