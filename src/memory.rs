use num_traits::ToPrimitive;

use crate::detection::BBox;
use crate::slot::Slot;

/// Best-effort ceiling on the bytes held by captured crops.
///
/// Usage is recomputed from the slots on every attempt rather than reserved,
/// so a single capture may overshoot by at most its own footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    limit: u64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    #[inline]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes a packed 3-channel crop of `bbox` would take.
    pub fn projected_footprint(bbox: &BBox) -> u64 {
        let span = |lo: f32, hi: f32| {
            (hi.round() - lo.round() + 1.0)
                .max(0.0)
                .to_u64()
                .unwrap_or(u64::MAX / 4)
        };
        span(bbox.x1, bbox.x2)
            .saturating_mul(3)
            .saturating_mul(span(bbox.y1, bbox.y2))
    }

    /// Sum of `stride * height` over every slot holding an image.
    pub fn used(slots: &[Slot]) -> u64 {
        slots
            .iter()
            .filter_map(|s| s.image.as_ref())
            .map(|img| img.footprint() as u64)
            .sum()
    }

    /// Whether replacing `old` bytes with `new` bytes keeps usage within the limit.
    pub fn allows(&self, used: u64, old: u64, new: u64) -> bool {
        used.saturating_sub(old).saturating_add(new) <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projected_footprint() {
        let bbox = BBox::new(10.4, 20.6, 29.5, 30.2, 1.0);
        assert_eq!(MemoryBudget::projected_footprint(&bbox), 21 * 3 * 10);
        let inverted = BBox::new(30.0, 0.0, 10.0, 10.0, 1.0);
        assert_eq!(MemoryBudget::projected_footprint(&inverted), 0);
    }

    #[test]
    fn test_allows() {
        let budget = MemoryBudget::new(1000);
        assert!(budget.allows(0, 0, 1000));
        assert!(!budget.allows(0, 0, 1001));
        assert!(budget.allows(900, 400, 500));
        assert!(!budget.allows(900, 0, 101));
        assert!(!MemoryBudget::new(0).allows(0, 0, 1));
    }
}
