use crate::types::{ExamId, PipelineError, Result, TakerId};

pub const SEGMENT_PREFIX: &str = "webcam_";
pub const MERGED_STEM: &str = "merged";

/// Storage folder holding every object of one taker's session.
pub fn session_prefix(exam_id: ExamId, taker_id: TakerId) -> String {
    format!("{}/{}/", exam_id, taker_id)
}

pub fn segment_key(exam_id: ExamId, taker_id: TakerId, start: i64, end: i64, ext: &str) -> String {
    format!("{}{}{}_{}.{}", session_prefix(exam_id, taker_id), SEGMENT_PREFIX, start, end, ext)
}

pub fn merged_key(exam_id: ExamId, taker_id: TakerId, ext: &str) -> String {
    format!("{}{}.{}", session_prefix(exam_id, taker_id), MERGED_STEM, ext)
}

/// A stored webcam recording with the offsets embedded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub key: String,
    pub start: i64,
    pub end: i64,
}

impl SegmentKey {
    /// Parses `.../webcam_<start>_<end>.<ext>`.
    pub fn parse(key: &str) -> Result<Self> {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let stem = file_name
            .strip_prefix(SEGMENT_PREFIX)
            .ok_or_else(|| PipelineError::MalformedSegment(key.to_string()))?;
        let stem = match stem.rfind('.') {
            Some(dot) => &stem[..dot],
            None => stem,
        };

        let mut offsets = stem.split('_');
        let (start, end) = match (offsets.next(), offsets.next(), offsets.next()) {
            (Some(start), Some(end), None) => (start, end),
            _ => return Err(PipelineError::MalformedSegment(key.to_string())),
        };

        let start: i64 = start.parse().map_err(|_| PipelineError::MalformedSegment(key.to_string()))?;
        let end: i64 = end.parse().map_err(|_| PipelineError::MalformedSegment(key.to_string()))?;

        if start < 0 || end <= start {
            return Err(PipelineError::MalformedSegment(key.to_string()));
        }

        Ok(Self { key: key.to_string(), start, end })
    }

    /// Whether a listed key is meant to be a segment at all.
    pub fn is_candidate(key: &str) -> bool {
        key.rsplit('/').next().unwrap_or(key).starts_with(SEGMENT_PREFIX)
    }

    /// Whether the key's file name ends in `.<ext>`.
    pub fn has_extension(key: &str, ext: &str) -> bool {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        file_name
            .rsplit_once('.')
            .is_some_and(|(_, found)| found.eq_ignore_ascii_case(ext.trim_start_matches('.')))
    }

    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_key() {
        let segment = SegmentKey::parse("7/42/webcam_150_260.webm").unwrap();
        assert_eq!(segment.start, 150);
        assert_eq!(segment.end, 260);
        assert_eq!(segment.file_name(), "webcam_150_260.webm");
        assert_eq!(segment.duration(), 110);
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for key in [
            "7/42/merged.webm",
            "7/42/webcam_abc_10.webm",
            "7/42/webcam_10.webm",
            "7/42/webcam_1_2_3.webm",
            "7/42/webcam_20_10.webm",
            "7/42/webcam_10_10.webm",
        ] {
            assert!(SegmentKey::parse(key).is_err(), "{} should be rejected", key);
        }
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(session_prefix(7, 42), "7/42/");
        assert_eq!(segment_key(7, 42, 0, 100, "webm"), "7/42/webcam_0_100.webm");
        assert_eq!(merged_key(7, 42, "webm"), "7/42/merged.webm");
        assert!(SegmentKey::is_candidate("7/42/webcam_0_100.webm"));
        assert!(SegmentKey::is_candidate("7/42/webcam_broken.webm"));
        assert!(!SegmentKey::is_candidate("7/42/merged.webm"));
        assert!(SegmentKey::has_extension("7/42/webcam_0_100.webm", "webm"));
        assert!(SegmentKey::has_extension("7/42/webcam_0_100.WEBM", ".webm"));
        assert!(!SegmentKey::has_extension("7/42/webcam_0_100.mp4", "webm"));
        assert!(!SegmentKey::has_extension("7/42/webcam_0_100", "webm"));
    }
}
