use crate::capture::{BestShot, CaptureEngine, CycleReport, FrameClock};
use crate::config::Config;
use crate::detection::Detection;
use crate::error::Result;
use crate::frame::{Frame, ImageCropper, PackedCropper};
use crate::quality::{QualityModel, UpstreamQuality};
use crate::tracker::{TrackedDetection, Tracker};

/// Result of one [`FaceCapture::run`] call.
#[derive(Debug, Clone, Default)]
pub struct FrameResult {
    /// Frame clock value the frame was processed at.
    pub frame: u64,
    /// Tracking result per input detection.
    pub tracks: Vec<Option<TrackedDetection>>,
    pub report: CycleReport,
}

/// Tracker and capture engine wired together, one call per frame.
pub struct FaceCapture {
    tracker: Tracker,
    engine: CaptureEngine,
    cropper: Box<dyn ImageCropper>,
    clock: FrameClock,
}

impl FaceCapture {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mut engine = CaptureEngine::new(config.buffer_size)?;
        engine.set_config(config.capture)?;
        engine.set_mode(config.mode);
        if config.use_quality_model {
            engine.set_quality_model(Some(Box::new(UpstreamQuality)));
        }
        Ok(Self {
            tracker: Tracker::new(config.tracker)?,
            engine,
            cropper: Box::new(PackedCropper),
            clock: FrameClock::new(),
        })
    }

    pub fn with_cropper(mut self, cropper: Box<dyn ImageCropper>) -> Self {
        self.cropper = cropper;
        self
    }

    pub fn with_quality_model(mut self, model: Box<dyn QualityModel>) -> Self {
        self.engine.set_quality_model(Some(model));
        self
    }

    pub fn with_clock(mut self, clock: FrameClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn engine(&self) -> &CaptureEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut CaptureEngine {
        &mut self.engine
    }

    /// Track, then run the capture cycle, then advance the clock.
    ///
    /// A failed capture cycle is returned as an error; the tracker has still
    /// consumed the frame and the clock still advances. Shots emitted before
    /// the failure are still listed by [`FaceCapture::outputs`].
    pub fn run(&mut self, frame: &Frame, detections: &[Detection]) -> Result<FrameResult> {
        let now = self.clock.now();
        let tracks = self.tracker.track(detections);
        let report = self
            .engine
            .run_cycle(frame, detections, &tracks, now, self.cropper.as_ref());
        self.clock.tick();
        Ok(FrameResult {
            frame: now,
            tracks,
            report: report?,
        })
    }

    /// Best shots emitted by the last frame.
    pub fn outputs(&self) -> impl Iterator<Item = BestShot<'_>> {
        self.engine.outputs()
    }

    /// Free every slot, drop every track and restart IDs.
    pub fn reset(&mut self) {
        self.engine.clean_all();
        self.tracker.clear();
        self.tracker.clean_counter();
    }
}
