pub mod capture;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod kalman_filter;
pub mod matching;
pub mod memory;
pub mod pipeline;
pub mod quality;
pub mod slot;
pub mod source;
pub mod track;
pub mod tracker;
pub mod utils;

// Re-export main types
pub use crate::capture::{CaptureEngine, CycleReport, FrameClock};
pub use crate::config::{CaptureConfig, CaptureMode, Config, QualityMethod, TrackerConfig};
pub use crate::detection::{BBox, Detection, HeadPose, Landmarks};
pub use crate::error::{Error, Result};
pub use crate::frame::{Frame, Image, ImageCropper, PackedCropper, PixelFormat};
pub use crate::pipeline::FaceCapture;
pub use crate::tracker::{TrackStatus, TrackedDetection, Tracker};
