use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use crate::detection::Detection;
use crate::error::Result;

/// Detections of one recorded frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameLog {
    #[serde(default)]
    pub frame: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Image file for the frame, relative to the replay's image directory.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Anything that yields per-frame detections, e.g. a detector or a recording.
pub trait DetectionSource {
    /// Next frame, `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameLog>>;
}

/// Replays frames recorded as a JSON array or as JSON lines.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    frames: VecDeque<FrameLog>,
}

impl ReplaySource {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let trimmed = data.trim_start();
        let frames: Vec<FrameLog> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else {
            trimmed
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str::<FrameLog>)
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        tracing::info!(frames = frames.len(), "replay loaded");
        Ok(Self {
            frames: frames.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl DetectionSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<FrameLog>> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let data = r#"
{"frame":0,"width":64,"height":48,"detections":[{"bbox":{"x1":1,"y1":2,"x2":30,"y2":40,"score":0.9}}]}

{"frame":1,"detections":[]}
"#;
        let mut src = ReplaySource::from_json(data).unwrap();
        assert_eq!(src.len(), 2);
        let first = src.next_frame().unwrap().unwrap();
        assert_eq!(first.width, 64);
        assert_eq!(first.detections.len(), 1);
        assert_eq!(src.next_frame().unwrap().unwrap().frame, 1);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_json_array() {
        let data = r#"[{"frame":3,"image":"f3.png"},{"frame":4}]"#;
        let mut src = ReplaySource::from_json(data).unwrap();
        let first = src.next_frame().unwrap().unwrap();
        assert_eq!(first.image.as_deref(), Some("f3.png"));
        assert!(first.detections.is_empty());
        assert_eq!(src.len(), 1);
    }

    #[test]
    fn test_bad_json() {
        assert!(ReplaySource::from_json("{not json}").is_err());
    }
}
