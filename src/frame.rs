use image::RgbImage;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::detection::{BBox, Landmarks};
use crate::error::{Error, Result};

/// Side of the aligned face crop.
pub const ALIGNED_FACE_SIZE: u32 = 112;

/// Canonical five-point face layout inside a 112x112 crop.
const FACE_TEMPLATE: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PixelFormat {
    Rgb888,
    Bgr888,
    Rgb888Planar,
    Yuv420Planar,
    Yuv400,
}

impl PixelFormat {
    /// Interleaved three-byte formats the cropper can read directly.
    #[inline]
    pub fn is_packed_rgb(self) -> bool {
        matches!(self, PixelFormat::Rgb888 | PixelFormat::Bgr888)
    }
}

/// Owned pixel buffer. Frames come from the video source, images are crops
/// held by capture slots; both share this layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

pub type Frame = Image;

impl Image {
    /// Zero-filled packed buffer with a tight stride.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize * 3;
        Self {
            width,
            height,
            stride,
            format,
            data: vec![0; stride * height as usize],
        }
    }

    pub fn from_rgb(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            stride: width as usize * 3,
            format: PixelFormat::Rgb888,
            data: img.into_raw(),
        }
    }

    /// Bytes charged against the memory budget.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.stride * self.height as usize
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let off = y as usize * self.stride + x as usize * 3;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    #[inline]
    fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 3]) {
        let off = y as usize * self.stride + x as usize * 3;
        self.data[off..off + 3].copy_from_slice(&px);
    }

    /// Convert a packed crop to an `RgbImage`, swapping channels for BGR.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        if !self.format.is_packed_rgb() {
            return Err(Error::UnsupportedPixelFormat(self.format));
        }
        let mut out = RgbImage::new(self.width, self.height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let [a, b, c] = self.pixel(x, y);
            px.0 = match self.format {
                PixelFormat::Bgr888 => [c, b, a],
                _ => [a, b, c],
            };
        }
        Ok(out)
    }
}

/// Produces owned crops out of a frame. Implementations may block, but must
/// fail with an error rather than panic on formats they cannot handle.
pub trait ImageCropper {
    fn crop(
        &self,
        frame: &Frame,
        bbox: &BBox,
        landmarks: Option<&Landmarks>,
        aligned: bool,
    ) -> Result<Image>;
}

/// Software cropper for packed RGB/BGR frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedCropper;

impl PackedCropper {
    fn crop_box(&self, frame: &Frame, bbox: &BBox) -> Result<Image> {
        let max_x = frame.width as f32 - 1.0;
        let max_y = frame.height as f32 - 1.0;
        let x1 = bbox.x1.round().clamp(0.0, max_x) as u32;
        let y1 = bbox.y1.round().clamp(0.0, max_y) as u32;
        let x2 = bbox.x2.round().clamp(0.0, max_x) as u32;
        let y2 = bbox.y2.round().clamp(0.0, max_y) as u32;
        if x2 < x1 || y2 < y1 {
            return Err(Error::Crop(format!("empty crop region {bbox:?}")));
        }

        let width = x2 - x1 + 1;
        let height = y2 - y1 + 1;
        let mut out = Image::new(width, height, frame.format);
        let row_bytes = width as usize * 3;
        for row in 0..height as usize {
            let src = (y1 as usize + row) * frame.stride + x1 as usize * 3;
            let dst = row * out.stride;
            out.data[dst..dst + row_bytes].copy_from_slice(&frame.data[src..src + row_bytes]);
        }
        Ok(out)
    }

    fn crop_aligned(&self, frame: &Frame, landmarks: &Landmarks) -> Result<Image> {
        if landmarks.len() < Landmarks::FACE_POINTS {
            return Err(Error::Crop(format!(
                "aligned crop needs {} landmarks, got {}",
                Landmarks::FACE_POINTS,
                landmarks.len()
            )));
        }
        let transform = similarity_transform(&landmarks.points()[..Landmarks::FACE_POINTS], &FACE_TEMPLATE)
            .ok_or_else(|| Error::Crop("degenerate landmarks".into()))?;
        let inverse = transform
            .try_inverse()
            .ok_or_else(|| Error::Crop("alignment transform is not invertible".into()))?;

        let mut out = Image::new(ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE, frame.format);
        for y in 0..ALIGNED_FACE_SIZE {
            for x in 0..ALIGNED_FACE_SIZE {
                let src = inverse * Vector3::new(x as f32, y as f32, 1.0);
                if let Some(px) = sample_bilinear(frame, src.x, src.y) {
                    out.put_pixel(x, y, px);
                }
            }
        }
        Ok(out)
    }
}

impl ImageCropper for PackedCropper {
    fn crop(
        &self,
        frame: &Frame,
        bbox: &BBox,
        landmarks: Option<&Landmarks>,
        aligned: bool,
    ) -> Result<Image> {
        if !frame.format.is_packed_rgb() {
            return Err(Error::UnsupportedPixelFormat(frame.format));
        }
        if frame.width == 0 || frame.height == 0 {
            return Err(Error::Crop("empty frame".into()));
        }
        if frame.data.len() < frame.footprint() || frame.stride < frame.width as usize * 3 {
            return Err(Error::Crop("frame buffer smaller than its geometry".into()));
        }
        match (aligned, landmarks) {
            (true, Some(lm)) => self.crop_aligned(frame, lm),
            (true, None) => Err(Error::Crop("aligned crop without landmarks".into())),
            (false, _) => self.crop_box(frame, bbox),
        }
    }
}

/// Least-squares similarity (rotation, uniform scale, translation) mapping
/// `src` onto `dst`, as a homogeneous 3x3 matrix.
pub fn similarity_transform(src: &[[f32; 2]], dst: &[[f32; 2]]) -> Option<Matrix3<f32>> {
    let n = src.len().min(dst.len());
    if n < 2 {
        return None;
    }
    let mean = |pts: &[[f32; 2]]| {
        let (sx, sy) = pts[..n]
            .iter()
            .fold((0.0, 0.0), |(ax, ay), p| (ax + p[0], ay + p[1]));
        (sx / n as f32, sy / n as f32)
    };
    let (sx, sy) = mean(src);
    let (dx, dy) = mean(dst);

    let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
    for (s, d) in src.iter().zip(dst).take(n) {
        let (px, py) = (s[0] - sx, s[1] - sy);
        let (qx, qy) = (d[0] - dx, d[1] - dy);
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        norm += px * px + py * py;
    }
    if norm < f32::EPSILON {
        return None;
    }
    let a = dot / norm;
    let b = cross / norm;
    let tx = dx - (a * sx - b * sy);
    let ty = dy - (b * sx + a * sy);

    Some(Matrix3::new(a, -b, tx, b, a, ty, 0.0, 0.0, 1.0))
}

fn sample_bilinear(frame: &Frame, x: f32, y: f32) -> Option<[u8; 3]> {
    if x < 0.0 || y < 0.0 || x > (frame.width - 1) as f32 || y > (frame.height - 1) as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(frame.width - 1);
    let y1 = (y0 + 1).min(frame.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let (p00, p10) = (frame.pixel(x0, y0), frame.pixel(x1, y0));
    let (p01, p11) = (frame.pixel(x0, y1), frame.pixel(x1, y1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}
