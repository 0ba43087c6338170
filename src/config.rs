use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const STD_WEIGHT_POSITION: f32 = 1.0 / 20.0;
const STD_WEIGHT_VELOCITY: f32 = 1.0 / 160.0;

/// Top-level configuration, usually loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub capture: CaptureConfig,
    pub mode: CaptureMode,
    /// Number of capture slots.
    pub buffer_size: usize,
    /// Use the installed quality model instead of the local heuristic.
    pub use_quality_model: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::face_capture(),
            capture: CaptureConfig::default(),
            mode: CaptureMode::Auto,
            buffer_size: 10,
            use_quality_model: false,
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidCapacity(0));
        }
        self.tracker.validate()?;
        self.capture.validate()
    }
}

/// Per-track lifecycle and initial-uncertainty settings.
///
/// Every standard deviation is computed as `alpha[i] + beta[i] * state[x_idx[i]]`,
/// which makes the noise scale with the box height for the dimensions that
/// reference index 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanTrackerConfig {
    pub max_unmatched_num: u32,
    pub accreditation_threshold: u32,
    pub feature_budget_size: usize,
    pub feature_update_interval: u32,
    pub p_alpha: [f32; 8],
    pub p_beta: [f32; 8],
    pub p_x_idx: [usize; 8],
}

impl Default for KalmanTrackerConfig {
    fn default() -> Self {
        let p = 2.0 * STD_WEIGHT_POSITION;
        let v = 10.0 * STD_WEIGHT_VELOCITY;
        Self {
            max_unmatched_num: 40,
            accreditation_threshold: 3,
            feature_budget_size: 8,
            feature_update_interval: 1,
            p_alpha: [0.0, 0.0, 1e-2, 0.0, 0.0, 0.0, 1e-5, 0.0],
            p_beta: [p, p, 0.0, p, v, v, 0.0, v],
            p_x_idx: [3, 3, 2, 3, 3, 3, 2, 3],
        }
    }
}

/// Process (Q) and measurement (R) noise of the motion model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanFilterConfig {
    pub q_alpha: [f32; 8],
    pub q_beta: [f32; 8],
    pub q_x_idx: [usize; 8],
    pub r_alpha: [f32; 4],
    pub r_beta: [f32; 4],
    pub r_x_idx: [usize; 4],
    /// Mahalanobis gate (squared distance).
    pub chi2_threshold: f32,
    /// Clamp predicted aspect ratio and height to stay positive.
    pub enable_bounding_stay: bool,
}

impl Default for KalmanFilterConfig {
    fn default() -> Self {
        let p = STD_WEIGHT_POSITION;
        let v = STD_WEIGHT_VELOCITY;
        Self {
            q_alpha: [0.0, 0.0, 1e-2, 0.0, 0.0, 0.0, 1e-5, 0.0],
            q_beta: [p, p, 0.0, p, v, v, 0.0, v],
            q_x_idx: [3, 3, 2, 3, 3, 3, 2, 3],
            r_alpha: [0.0, 0.0, 1e-1, 0.0],
            r_beta: [p, p, 0.0, p],
            r_x_idx: [3, 3, 2, 3],
            chi2_threshold: crate::utils::chi2inv95(4),
            enable_bounding_stay: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassTrackerConfig {
    pub ktracker: KalmanTrackerConfig,
    pub kfilter: KalmanFilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_distance_iou: f32,
    pub max_distance_cosine: f32,
    /// Confirmed tracks missed at most this many frames also take part in IoU matching.
    pub max_unmatched_times_for_bbox_matching: u32,
    /// Minimum detection score for an unmatched detection to spawn a track.
    pub min_confidence: f32,
    pub use_reid: bool,
    /// Reuse the IDs of deleted tracks (smallest free ID first).
    pub use_specific_counter: bool,
    /// Only associate detections and tracks of the same class.
    pub class_gating: bool,
    pub ktracker: KalmanTrackerConfig,
    pub kfilter: KalmanFilterConfig,
    pub class_overrides: HashMap<i32, ClassTrackerConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance_iou: 0.7,
            max_distance_cosine: 0.05,
            max_unmatched_times_for_bbox_matching: 2,
            min_confidence: 0.0,
            use_reid: false,
            use_specific_counter: false,
            class_gating: true,
            ktracker: KalmanTrackerConfig::default(),
            kfilter: KalmanFilterConfig::default(),
            class_overrides: HashMap::new(),
        }
    }
}

impl TrackerConfig {
    /// Settings tuned for face tracking ahead of the capture engine.
    pub fn face_capture() -> Self {
        let mut cfg = Self::default();
        cfg.ktracker.max_unmatched_num = 20;
        cfg.ktracker.accreditation_threshold = 10;
        cfg.ktracker.p_beta[2] = 0.1;
        cfg.ktracker.p_beta[6] = 2.5e-2;
        cfg.kfilter.q_beta[2] = 0.1;
        cfg.kfilter.q_beta[6] = 2.5e-2;
        cfg.kfilter.r_beta[2] = 0.1;
        cfg
    }

    /// Resolve the tracker/filter settings used for a class.
    pub fn for_class(&self, class_id: i32) -> (&KalmanTrackerConfig, &KalmanFilterConfig) {
        match self.class_overrides.get(&class_id) {
            Some(c) => (&c.ktracker, &c.kfilter),
            None => (&self.ktracker, &self.kfilter),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_distance_iou) {
            return Err(Error::InvalidConfig(format!(
                "max_distance_iou must be in [0, 1], got {}",
                self.max_distance_iou
            )));
        }
        if !(0.0..=2.0).contains(&self.max_distance_cosine) {
            return Err(Error::InvalidConfig(format!(
                "max_distance_cosine must be in [0, 2], got {}",
                self.max_distance_cosine
            )));
        }
        let all = std::iter::once((&self.ktracker, &self.kfilter)).chain(
            self.class_overrides
                .values()
                .map(|c| (&c.ktracker, &c.kfilter)),
        );
        for (kt, kf) in all {
            if kt.accreditation_threshold == 0 {
                return Err(Error::InvalidConfig(
                    "accreditation_threshold must be at least 1".into(),
                ));
            }
            if kt.feature_budget_size == 0 || kt.feature_update_interval == 0 {
                return Err(Error::InvalidConfig(
                    "feature_budget_size and feature_update_interval must be at least 1".into(),
                ));
            }
            let idx_ok = kt.p_x_idx.iter().chain(kf.q_x_idx.iter()).all(|&i| i < 8)
                && kf.r_x_idx.iter().all(|&i| i < 8);
            if !idx_ok {
                return Err(Error::InvalidConfig("noise x_idx must be below 8".into()));
            }
            if kf.chi2_threshold <= 0.0 {
                return Err(Error::InvalidConfig("chi2_threshold must be positive".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureMode {
    Auto,
    Fast,
    Cycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityMethod {
    AreaRatio,
    EyesDistance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub miss_time_limit: u32,
    /// Minimum box side in pixels, -1 disables.
    pub thr_size_min: i32,
    /// Maximum box side in pixels, -1 disables.
    pub thr_size_max: i32,
    pub qa_method: QualityMethod,
    pub thr_quality: f32,
    pub thr_quality_high: f32,
    pub thr_yaw: f32,
    pub thr_pitch: f32,
    pub thr_roll: f32,
    pub fast_m_interval: u32,
    pub fast_m_capture_num: u32,
    pub cycle_m_interval: u32,
    /// 0 disables the AUTO deadline.
    pub auto_m_time_limit: u32,
    pub auto_m_fast_cap: bool,
    pub capture_aligned_face: bool,
    /// Ceiling for all stored crops, in bytes.
    pub memory_limit: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            miss_time_limit: 40,
            thr_size_min: 32,
            thr_size_max: 512,
            qa_method: QualityMethod::AreaRatio,
            thr_quality: 0.1,
            thr_quality_high: 0.99,
            thr_yaw: 0.5,
            thr_pitch: 0.5,
            thr_roll: 0.5,
            fast_m_interval: 20,
            fast_m_capture_num: 3,
            cycle_m_interval: 20,
            auto_m_time_limit: 0,
            auto_m_fast_cap: true,
            capture_aligned_face: false,
            memory_limit: 2000 * 2000 * 3,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("thr_quality", self.thr_quality),
            ("thr_quality_high", self.thr_quality_high),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {v}"
                )));
            }
        }
        if self.thr_quality > self.thr_quality_high {
            return Err(Error::InvalidConfig(
                "thr_quality must not exceed thr_quality_high".into(),
            ));
        }
        if self.fast_m_interval == 0 || self.cycle_m_interval == 0 {
            return Err(Error::InvalidConfig("capture intervals must be at least 1".into()));
        }
        if self.thr_size_min < -1 || self.thr_size_max < -1 {
            return Err(Error::InvalidConfig("size thresholds must be -1 or positive".into()));
        }
        if self.thr_size_min >= 0 && self.thr_size_max >= 0 && self.thr_size_min > self.thr_size_max
        {
            return Err(Error::InvalidConfig("thr_size_min exceeds thr_size_max".into()));
        }
        Ok(())
    }
}
