use nalgebra::SVector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Axis-aligned box in corner format with the detector score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    #[serde(default)]
    pub score: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// A box with no extent cannot feed the motion model.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0) || !self.x1.is_finite() || !self.y1.is_finite()
    }

    /// Convert to measurement space `(center x, center y, aspect ratio w/h, height)`.
    pub fn to_xyah(&self) -> SVector<f32, 4> {
        let w = self.width();
        let h = self.height();
        SVector::<f32, 4>::new(self.x1 + w / 2.0, self.y1 + h / 2.0, w / h, h)
    }

    /// Convert back from measurement space.
    pub fn from_xyah(xyah: &SVector<f32, 4>, score: f32) -> Self {
        let h = xyah[3];
        let w = xyah[2] * h;
        Self::new(
            xyah[0] - w / 2.0,
            xyah[1] - h / 2.0,
            xyah[0] + w / 2.0,
            xyah[1] + h / 2.0,
            score,
        )
    }
}

/// Landmark points owned by one record, e.g. the five face points
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Landmarks(Vec<[f32; 2]>);

impl Landmarks {
    pub const FACE_POINTS: usize = 5;

    pub fn new(points: Vec<[f32; 2]>) -> Self {
        Self(points)
    }

    /// Build from split x/y arrays; both must have the same length.
    pub fn from_xy(xs: &[f32], ys: &[f32]) -> Result<Self> {
        if xs.len() != ys.len() {
            return Err(Error::DimensionMismatch {
                expected: xs.len(),
                got: ys.len(),
            });
        }
        Ok(Self(xs.iter().zip(ys).map(|(&x, &y)| [x, y]).collect()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<[f32; 2]> {
        self.0.get(idx).copied()
    }

    #[inline]
    pub fn points(&self) -> &[[f32; 2]] {
        &self.0
    }
}

/// Head pose angles, normalised so that 1.0 is a full quarter turn.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// A single detection result for one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    #[serde(default)]
    pub class_id: i32,
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
    #[serde(default)]
    pub feature: Option<Vec<f32>>,
    #[serde(default)]
    pub head_pose: Option<HeadPose>,
    /// Quality produced upstream (e.g. by a quality model).
    #[serde(default)]
    pub quality: Option<f32>,
}

impl Detection {
    pub fn new(bbox: BBox, class_id: i32) -> Self {
        Self {
            bbox,
            class_id,
            ..Default::default()
        }
    }

    pub fn with_landmarks(mut self, landmarks: Landmarks) -> Self {
        self.landmarks = Some(landmarks);
        self
    }

    pub fn with_feature(mut self, feature: Vec<f32>) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn with_head_pose(mut self, pose: HeadPose) -> Self {
        self.head_pose = Some(pose);
        self
    }

    #[inline]
    pub fn confidence(&self) -> f32 {
        self.bbox.score
    }

    #[inline]
    pub fn head_pose(&self) -> HeadPose {
        self.head_pose.unwrap_or_default()
    }
}
