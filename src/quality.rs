//! Face quality scoring and the replace-decision predicate.

use crate::config::{CaptureConfig, QualityMethod};
use crate::detection::Detection;
use crate::error::{Error, Result};
use crate::frame::Frame;

/// Face area that scores 1.0 under `AreaRatio`.
pub const FACE_AREA_STANDARD: f32 = 112.0 * 112.0;
/// Eye distance in pixels that scores 1.0 under `EyesDistance`.
pub const EYE_DISTANCE_STANDARD: f32 = 80.0;
/// Step the ramped replace threshold moves by.
pub const UPDATE_VALUE_MIN: f32 = 0.1;
/// Quality of a detection excluded by the pre-filter.
pub const SKIPPED: f32 = -1.0;

/// Substitute for the local heuristic, e.g. a quality-assessment network.
pub trait QualityModel {
    /// Return one score per detection; skipped entries should be [`SKIPPED`].
    fn assess(&mut self, frame: &Frame, detections: &[Detection], skip: &[bool]) -> Result<Vec<f32>>;
}

/// Uses the `quality` attached to each detection upstream, 0 when absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamQuality;

impl QualityModel for UpstreamQuality {
    fn assess(&mut self, _frame: &Frame, detections: &[Detection], skip: &[bool]) -> Result<Vec<f32>> {
        Ok(detections
            .iter()
            .zip(skip)
            .map(|(det, &skipped)| {
                if skipped {
                    SKIPPED
                } else {
                    det.quality.unwrap_or(0.0).clamp(0.0, 1.0)
                }
            })
            .collect())
    }
}

/// Whether a detection is too small, too large or turned too far to be worth
/// scoring. A size threshold of -1 is disabled.
pub fn should_skip(cfg: &CaptureConfig, det: &Detection) -> bool {
    let w = det.bbox.width();
    let h = det.bbox.height();
    if cfg.thr_size_min != -1 {
        let min = cfg.thr_size_min as f32;
        if w < min || h < min {
            return true;
        }
    }
    if cfg.thr_size_max != -1 {
        let max = cfg.thr_size_max as f32;
        if w > max || h > max {
            return true;
        }
    }
    let pose = det.head_pose();
    pose.yaw.abs() > cfg.thr_yaw || pose.pitch.abs() > cfg.thr_pitch || pose.roll.abs() > cfg.thr_roll
}

pub fn skip_signal(cfg: &CaptureConfig, detections: &[Detection]) -> Vec<bool> {
    detections.iter().map(|d| should_skip(cfg, d)).collect()
}

/// Local quality heuristic in [0, 1].
pub fn assess(method: QualityMethod, det: &Detection) -> f32 {
    match method {
        QualityMethod::AreaRatio => {
            let ratio = (det.bbox.area() / FACE_AREA_STANDARD).min(1.0);
            let pose = det.head_pose();
            let penalty = 1.0 - (pose.yaw.abs() + pose.pitch.abs() + pose.roll.abs()) / 3.0;
            (ratio * penalty).clamp(0.0, 1.0)
        }
        QualityMethod::EyesDistance => {
            let eyes = det
                .landmarks
                .as_ref()
                .and_then(|lm| Some((lm.get(0)?, lm.get(1)?)));
            match eyes {
                Some((l, r)) => {
                    let dist = ((l[0] - r[0]).powi(2) + (l[1] - r[1]).powi(2)).sqrt();
                    (dist / EYE_DISTANCE_STANDARD).clamp(0.0, 1.0)
                }
                None => 0.0,
            }
        }
    }
}

/// Score every detection with the local heuristic.
pub fn evaluate(cfg: &CaptureConfig, detections: &[Detection], skip: &[bool]) -> Vec<f32> {
    detections
        .iter()
        .zip(skip)
        .map(|(det, &skipped)| if skipped { SKIPPED } else { assess(cfg.qa_method, det) })
        .collect()
}

/// Score every detection with `model`, checking it returned one score each.
pub fn evaluate_with<M: QualityModel + ?Sized>(
    model: &mut M,
    frame: &Frame,
    detections: &[Detection],
    skip: &[bool],
) -> Result<Vec<f32>> {
    let scores = model.assess(frame, detections, skip)?;
    if scores.len() != detections.len() {
        return Err(Error::QualityModel(format!(
            "expected {} scores, got {}",
            detections.len(),
            scores.len()
        )));
    }
    Ok(scores)
}

/// `q_new` passes the base threshold and beats `cmp`.
#[inline]
pub fn is_qualified(cfg: &CaptureConfig, q_new: f32, cmp: f32) -> bool {
    q_new >= cfg.thr_quality && q_new > cmp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, HeadPose, Landmarks};
    use crate::frame::PixelFormat;
    use approx::assert_relative_eq;

    fn face(side: f32) -> Detection {
        Detection::new(BBox::new(0.0, 0.0, side, side, 0.9), 0)
    }

    #[test]
    fn test_skip_by_size() {
        let cfg = CaptureConfig::default();
        assert!(should_skip(&cfg, &face(20.0)));
        assert!(!should_skip(&cfg, &face(64.0)));
        assert!(should_skip(&cfg, &face(600.0)));

        let mut open = cfg.clone();
        open.thr_size_min = -1;
        open.thr_size_max = -1;
        assert!(!should_skip(&open, &face(2.0)));
        assert!(!should_skip(&open, &face(2000.0)));
    }

    #[test]
    fn test_skip_by_pose() {
        let cfg = CaptureConfig::default();
        let turned = face(64.0).with_head_pose(HeadPose {
            yaw: -0.6,
            pitch: 0.0,
            roll: 0.0,
        });
        assert!(should_skip(&cfg, &turned));
        assert_eq!(skip_signal(&cfg, &[face(64.0), turned]), vec![false, true]);
    }

    #[test]
    fn test_area_ratio() {
        assert_relative_eq!(assess(QualityMethod::AreaRatio, &face(56.0)), 0.25);
        assert_relative_eq!(assess(QualityMethod::AreaRatio, &face(200.0)), 1.0);
        let tilted = face(200.0).with_head_pose(HeadPose {
            yaw: 0.3,
            pitch: -0.3,
            roll: 0.3,
        });
        assert_relative_eq!(assess(QualityMethod::AreaRatio, &tilted), 0.7, epsilon = 1e-6);
    }

    #[test]
    fn test_eyes_distance() {
        let lm = Landmarks::new(vec![[10.0, 10.0], [50.0, 10.0], [30.0, 30.0]]);
        let det = face(100.0).with_landmarks(lm);
        assert_relative_eq!(assess(QualityMethod::EyesDistance, &det), 0.5);
        assert_eq!(assess(QualityMethod::EyesDistance, &face(100.0)), 0.0);
    }

    #[test]
    fn test_is_qualified() {
        let cfg = CaptureConfig::default();
        assert!(is_qualified(&cfg, 0.5, 0.4));
        assert!(!is_qualified(&cfg, 0.5, 0.5));
        assert!(!is_qualified(&cfg, 0.05, -1.0));
        assert!(is_qualified(&cfg, 0.1, -1.0));
    }

    #[test]
    fn test_evaluate_with_model() {
        let cfg = CaptureConfig::default();
        let frame = Frame::new(4, 4, PixelFormat::Rgb888);
        let mut det = face(64.0);
        det.quality = Some(0.8);
        let dets = vec![det, face(10.0)];
        let skip = skip_signal(&cfg, &dets);

        let scores = evaluate_with(&mut UpstreamQuality, &frame, &dets, &skip).unwrap();
        assert_eq!(scores, vec![0.8, SKIPPED]);

        let local = evaluate(&cfg, &dets, &skip);
        assert_relative_eq!(local[0], 64.0 * 64.0 / FACE_AREA_STANDARD);
        assert_eq!(local[1], SKIPPED);
    }

    struct Broken;

    impl QualityModel for Broken {
        fn assess(&mut self, _: &Frame, _: &[Detection], _: &[bool]) -> Result<Vec<f32>> {
            Ok(vec![0.5])
        }
    }

    #[test]
    fn test_model_length_mismatch() {
        let frame = Frame::new(4, 4, PixelFormat::Rgb888);
        let dets = vec![face(64.0), face(64.0)];
        let err = evaluate_with(&mut Broken, &frame, &dets, &[false, false]).unwrap_err();
        assert!(matches!(err, Error::QualityModel(_)));
    }
}
