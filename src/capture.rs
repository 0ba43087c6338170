//! Best-shot capture engine.
//!
//! A fixed array of slots is bound to stable tracks. Every cycle runs, in
//! order: clean (MISS slots go back to IDLE), match/age, emit, evict and the
//! capture pass that crops pending best shots out of the frame under the
//! memory budget.

use serde::Serialize;

use crate::config::{CaptureConfig, CaptureMode};
use crate::detection::Detection;
use crate::error::{Error, Result};
use crate::frame::{Frame, Image, ImageCropper, ALIGNED_FACE_SIZE};
use crate::memory::MemoryBudget;
use crate::quality::{self, QualityModel, UPDATE_VALUE_MIN};
use crate::slot::{FaceRecord, Slot, SlotState};
use crate::tracker::{TrackStatus, TrackedDetection};

/// Frame counter driving Δt. Wraps to 0 after `u64::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameClock {
    now: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: u64) -> Self {
        Self { now }
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Advance one frame and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.now = self.now.wrapping_add(1);
        self.now
    }
}

/// What happened during one [`CaptureEngine::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Slots whose best shot is ready this cycle.
    pub emitted: Vec<usize>,
    /// Slots whose capture the memory budget denied.
    pub dropped: Vec<usize>,
    /// Slots whose crop failed this cycle.
    pub failed: Vec<usize>,
    /// Track IDs that found no free slot.
    pub overflowed: Vec<u64>,
    /// Per-detection quality, [`quality::SKIPPED`] for skipped ones.
    pub qualities: Vec<f32>,
}

/// An emitted best shot, borrowed from its slot.
#[derive(Debug, Clone, Copy)]
pub struct BestShot<'a> {
    pub slot: usize,
    pub track_id: u64,
    pub record: &'a FaceRecord,
    pub image: &'a Image,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSummary {
    pub index: usize,
    pub state: SlotState,
    pub track_id: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub quality: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub slots: Vec<SlotSummary>,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

pub struct CaptureEngine {
    slots: Vec<Slot>,
    config: CaptureConfig,
    mode: CaptureMode,
    budget: MemoryBudget,
    quality_model: Option<Box<dyn QualityModel>>,
}

impl CaptureEngine {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity(capacity));
        }
        let config = CaptureConfig::default();
        tracing::info!(capacity, "capture engine created");
        Ok(Self {
            slots: vec![Slot::default(); capacity],
            budget: MemoryBudget::new(config.memory_limit),
            config,
            mode: CaptureMode::Auto,
            quality_model: None,
        })
    }

    /// Replace the configuration. Nothing changes if it does not validate.
    pub fn set_config(&mut self, config: CaptureConfig) -> Result<()> {
        config.validate()?;
        self.budget = MemoryBudget::new(config.memory_limit);
        self.config = config;
        tracing::info!(config = ?self.config, "capture config set");
        Ok(())
    }

    pub fn set_mode(&mut self, mode: CaptureMode) {
        tracing::info!(?mode, "capture mode set");
        self.mode = mode;
    }

    /// Install or remove the model that replaces the local quality heuristic.
    pub fn set_quality_model(&mut self, model: Option<Box<dyn QualityModel>>) {
        self.quality_model = model;
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_alive()).count()
    }

    pub fn used_bytes(&self) -> u64 {
        MemoryBudget::used(&self.slots)
    }

    /// Best shots flagged for output by the last cycle, including one that
    /// failed after its emit pass.
    pub fn outputs(&self) -> impl Iterator<Item = BestShot<'_>> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            if !s.output {
                return None;
            }
            Some(BestShot {
                slot,
                track_id: s.track_id?,
                record: s.best.as_ref()?,
                image: s.image.as_ref()?,
            })
        })
    }

    /// Return every MISS slot to IDLE. Returns how many were cleaned.
    pub fn clean_missed(&mut self) -> usize {
        let mut cleaned = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Miss {
                tracing::debug!(slot = i, track_id = ?slot.track_id, "slot cleaned");
                slot.clean();
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Free every slot.
    pub fn clean_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.clean();
        }
    }

    pub fn summary(&self) -> CaptureSummary {
        let slots: Vec<SlotSummary> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, s)| SlotSummary {
                index,
                state: s.state,
                track_id: s.track_id,
                width: s.image.as_ref().map_or(0, |img| img.width),
                height: s.image.as_ref().map_or(0, |img| img.height),
                bytes: s.footprint(),
                quality: s.stored_quality(),
            })
            .collect();
        for s in &slots {
            tracing::debug!(
                slot = s.index,
                state = ?s.state,
                track_id = ?s.track_id,
                width = s.width,
                height = s.height,
                bytes = s.bytes,
                "slot summary"
            );
        }
        CaptureSummary {
            slots,
            used_bytes: self.used_bytes(),
            limit_bytes: self.budget.limit(),
        }
    }

    /// Run one capture cycle.
    ///
    /// `tracked` is aligned with `detections` (the output of the tracker for
    /// this frame) and `now` is the frame clock.
    ///
    /// A crop that fails only affects its own slot and is listed in
    /// [`CycleReport::failed`]. A frame that cannot be captured at all returns
    /// an error; shots flagged before that are still readable through
    /// [`CaptureEngine::outputs`] until the next cycle.
    pub fn run_cycle(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        tracked: &[Option<TrackedDetection>],
        now: u64,
        cropper: &dyn ImageCropper,
    ) -> Result<CycleReport> {
        self.reset_flags();
        if tracked.len() != detections.len() {
            return Err(Error::DimensionMismatch {
                expected: detections.len(),
                got: tracked.len(),
            });
        }

        let skip = quality::skip_signal(&self.config, detections);
        let qualities = match self.quality_model.as_mut() {
            Some(model) => quality::evaluate_with(&mut **model, frame, detections, &skip)?,
            None => quality::evaluate(&self.config, detections, &skip),
        };

        self.clean_missed();

        let mut report = CycleReport {
            qualities,
            ..Default::default()
        };
        self.update(detections, tracked, &skip, now, &mut report);
        report.emitted = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.output)
            .map(|(i, _)| i)
            .collect();
        self.capture(frame, cropper, &mut report)?;
        Ok(report)
    }

    fn reset_flags(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.output = false;
            slot.dropped = false;
            slot.first_capture = false;
        }
    }

    fn find_alive(&self, track_id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.is_alive() && s.track_id == Some(track_id))
    }

    fn find_free(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.is_idle() && !s.capture_pending)
    }

    fn update(
        &mut self,
        detections: &[Detection],
        tracked: &[Option<TrackedDetection>],
        skip: &[bool],
        now: u64,
        report: &mut CycleReport,
    ) {
        for slot in self.slots.iter_mut().filter(|s| s.is_alive()) {
            slot.miss_counter = slot.miss_counter.saturating_add(1);
        }

        for (i, det) in detections.iter().enumerate() {
            let Some(td) = tracked[i] else { continue };
            if td.status != TrackStatus::Stable {
                continue;
            }
            let q = report.qualities[i];
            let record = FaceRecord::from_detection(det, q, now);

            match self.find_alive(td.track_id) {
                Some(idx) => self.update_bound(idx, record, skip[i], now),
                None => {
                    if skip[i] || q < self.config.thr_quality {
                        continue;
                    }
                    match self.find_free() {
                        Some(idx) => {
                            tracing::debug!(slot = idx, track_id = td.track_id, quality = q, "slot bound");
                            self.slots[idx].bind(td.track_id, record, now);
                        }
                        None => {
                            tracing::warn!(track_id = td.track_id, "capture buffer overflow");
                            report.overflowed.push(td.track_id);
                        }
                    }
                }
            }
        }

        self.evict();
    }

    /// Refresh a bound slot, apply the replace policy and the emit timing.
    fn update_bound(&mut self, idx: usize, record: FaceRecord, skipped: bool, now: u64) {
        let cfg = &self.config;
        let slot = &mut self.slots[idx];
        slot.miss_counter = 0;
        slot.last_seen = Some(record.clone());

        let dt = now.wrapping_sub(slot.timestamp);
        let current = slot.stored_quality();
        let q = record.quality;

        if !skipped {
            let capture = match self.mode {
                CaptureMode::Auto => {
                    let time_out = cfg.auto_m_time_limit != 0 && dt > u64::from(cfg.auto_m_time_limit);
                    if time_out {
                        quality::is_qualified(cfg, q, current)
                    } else if current < cfg.thr_quality_high {
                        let threshold = if current < cfg.thr_quality {
                            0.0
                        } else {
                            (current + UPDATE_VALUE_MIN).min(cfg.thr_quality_high)
                        };
                        quality::is_qualified(cfg, q, threshold)
                    } else {
                        false
                    }
                }
                CaptureMode::Fast | CaptureMode::Cycle => {
                    let (interval, capped) = match self.mode {
                        CaptureMode::Fast => (cfg.fast_m_interval, slot.out_counter >= cfg.fast_m_capture_num),
                        _ => (cfg.cycle_m_interval, false),
                    };
                    if capped {
                        false
                    } else if dt < u64::from(interval) {
                        let threshold = if current < cfg.thr_quality {
                            -1.0
                        } else if current + UPDATE_VALUE_MIN >= 1.0 {
                            current
                        } else {
                            current + UPDATE_VALUE_MIN
                        };
                        quality::is_qualified(cfg, q, threshold)
                    } else {
                        // window restart
                        slot.timestamp = now;
                        quality::is_qualified(cfg, q, -1.0)
                    }
                }
            };
            if capture {
                tracing::debug!(slot = idx, quality = q, previous = current, "best shot replaced");
                slot.accept(record);
            }
        } else if matches!(self.mode, CaptureMode::Fast | CaptureMode::Cycle) {
            let interval = match self.mode {
                CaptureMode::Fast => cfg.fast_m_interval,
                _ => cfg.cycle_m_interval,
            };
            let capped = self.mode == CaptureMode::Fast && slot.out_counter >= cfg.fast_m_capture_num;
            if !capped && dt >= u64::from(interval) {
                slot.timestamp = now;
            }
        }

        let stored_ok = quality::is_qualified(cfg, slot.stored_quality(), -1.0);
        let emit = match self.mode {
            CaptureMode::Auto => {
                let mut emit = false;
                if cfg.auto_m_fast_cap
                    && !slot.auto_fast_emitted
                    && dt >= u64::from(cfg.fast_m_interval)
                    && slot.out_counter < 1
                    && stored_ok
                {
                    slot.auto_fast_emitted = true;
                    emit = true;
                }
                if cfg.auto_m_time_limit != 0
                    && !slot.auto_deadline_emitted
                    && dt == u64::from(cfg.auto_m_time_limit)
                    && stored_ok
                {
                    slot.auto_deadline_emitted = true;
                    emit = true;
                }
                emit
            }
            CaptureMode::Fast => {
                slot.out_counter < cfg.fast_m_capture_num
                    && dt == u64::from(cfg.fast_m_interval) - 1
                    && stored_ok
            }
            CaptureMode::Cycle => dt == u64::from(cfg.cycle_m_interval) - 1 && stored_ok,
        };
        if emit {
            slot.output = true;
            slot.out_counter += 1;
            tracing::debug!(slot = idx, track_id = ?slot.track_id, dt, out = slot.out_counter, "best shot emitted");
        }
    }

    /// ALIVE slots missing for too long move to MISS, emitting a final shot.
    fn evict(&mut self) {
        let cfg = &self.config;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_alive() || slot.miss_counter <= cfg.miss_time_limit {
                continue;
            }
            slot.state = SlotState::Miss;
            // a lost track never gets its pending replacement
            slot.reject_pending();
            let qualified = quality::is_qualified(cfg, slot.stored_quality(), -1.0);
            let emit = match self.mode {
                CaptureMode::Auto => qualified,
                CaptureMode::Fast | CaptureMode::Cycle => qualified && slot.out_counter == 0,
            };
            if emit {
                slot.output = true;
                slot.out_counter += 1;
            }
            tracing::debug!(slot = i, track_id = ?slot.track_id, emit, "slot evicted");
        }
    }

    fn projected_footprint(&self, record: &FaceRecord) -> u64 {
        if self.config.capture_aligned_face {
            u64::from(ALIGNED_FACE_SIZE) * 3 * u64::from(ALIGNED_FACE_SIZE)
        } else {
            MemoryBudget::projected_footprint(&record.bbox)
        }
    }

    fn capture(&mut self, frame: &Frame, cropper: &dyn ImageCropper, report: &mut CycleReport) -> Result<()> {
        let pending: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].capture_pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if !frame.format.is_packed_rgb() {
            tracing::error!(format = ?frame.format, "frame format not capturable");
            self.rollback_first_captures(&pending);
            return Err(Error::UnsupportedPixelFormat(frame.format));
        }

        for &i in &pending {
            let Some(record) = self.slots[i].candidate.clone() else {
                self.slots[i].capture_pending = false;
                continue;
            };
            let first = !self.slots[i].is_alive();
            let used = MemoryBudget::used(&self.slots);
            let old = self.slots[i].footprint();
            let new = self.projected_footprint(&record);

            if !self.budget.allows(used, old, new) {
                tracing::warn!(
                    slot = i,
                    track_id = ?self.slots[i].track_id,
                    used,
                    new,
                    limit = self.budget.limit(),
                    "capture dropped by memory budget"
                );
                report.dropped.push(i);
                let slot = &mut self.slots[i];
                if first {
                    slot.clean();
                } else {
                    slot.reject_pending();
                }
                slot.dropped = true;
                continue;
            }

            let crop = cropper.crop(
                frame,
                &record.bbox,
                record.landmarks.as_ref(),
                self.config.capture_aligned_face,
            );
            match crop {
                Ok(image) => {
                    let slot = &mut self.slots[i];
                    slot.image = Some(image);
                    slot.best = slot.candidate.take();
                    slot.capture_pending = false;
                    if first {
                        slot.state = SlotState::Alive;
                        slot.first_capture = true;
                    }
                }
                Err(e) => {
                    tracing::error!(slot = i, track_id = ?self.slots[i].track_id, error = %e, "crop failed");
                    report.failed.push(i);
                    let slot = &mut self.slots[i];
                    if first {
                        slot.clean();
                    } else {
                        slot.reject_pending();
                    }
                }
            }
        }
        Ok(())
    }

    /// Undo bindings whose first capture never happened.
    fn rollback_first_captures(&mut self, pending: &[usize]) {
        for &i in pending {
            let slot = &mut self.slots[i];
            if slot.capture_pending && slot.is_idle() {
                slot.clean();
            }
        }
    }
}
