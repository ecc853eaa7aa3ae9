use std::{
    f32::consts::PI,
    hash::{Hash, Hasher},
};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

/// Normalized grain window parameters, as exposed to users. Converted to a [`WindowShape`] for a
/// specific max grain width in samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowParams {
    /// Blend between the first (0) and second (1) window lobe.
    pub mix: f32,
    /// Half width of the first lobe, relative to the max grain width.
    pub width0: f32,
    /// Half width of the second lobe, relative to the space left by the first lobe.
    pub width1: f32,
    /// Offset of the second lobe, relative to the space left by the second lobe.
    pub phase1: f32,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            mix: 0.5,
            width0: 0.1,
            width1: 0.1,
            phase1: 0.0,
        }
    }
}

impl WindowParams {
    pub fn with_mix(mut self, mix: f32) -> Self {
        self.mix = mix;
        self
    }

    pub fn with_width0(mut self, width0: f32) -> Self {
        self.width0 = width0;
        self
    }

    pub fn with_width1(mut self, width1: f32) -> Self {
        self.width1 = width1;
        self
    }

    pub fn with_phase1(mut self, phase1: f32) -> Self {
        self.phase1 = phase1;
        self
    }

    /// Validate all parameters. Returns `Error::ParameterError` on errors.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.mix) {
            return Err(Error::ParameterError(format!(
                "window mix must be in range [0, 1], but is {}",
                self.mix
            )));
        }
        if !(0.0..=1.0).contains(&self.width0) || !(0.0..=1.0).contains(&self.width1) {
            return Err(Error::ParameterError(format!(
                "window widths must be in range [0, 1], but are {} and {}",
                self.width0, self.width1
            )));
        }
        if !(-1.0..=1.0).contains(&self.phase1) {
            return Err(Error::ParameterError(format!(
                "window phase must be in range [-1, 1], but is {}",
                self.phase1
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Inclusive sample offset range of a [`WindowShape`], relative to the grain center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRange {
    pub start: i64,
    pub end: i64,
}

impl WindowRange {
    /// Number of sample frames in the range.
    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.start && offset <= self.end
    }
}

// -------------------------------------------------------------------------------------------------

/// Grain amplitude envelope, blended from two raised cosine lobes: the first one is centered
/// on the grain, the second one is shifted by `phase1` samples.
///
/// Window shapes are part of waveform cache keys, so equality is exact: two shapes are equal
/// only when all fields are bit-identical.
#[derive(Debug, Clone, Copy)]
pub struct WindowShape {
    mix: f32,
    width0: u32,
    width1: u32,
    phase1: i32,
}

impl WindowShape {
    /// Create a new window shape for the given max grain width in samples.
    /// Parameters are clamped into their valid ranges.
    pub fn new(max_grain_width_samples: f32, params: &WindowParams) -> Self {
        let max_width = max_grain_width_samples.max(1.0);
        let mix = params.mix.clamp(0.0, 1.0);
        let width0 = 1.0 + (params.width0.clamp(0.0, 1.0) * (max_width - 1.0)).round();
        let width1 = width0 + (params.width1.clamp(0.0, 1.0) * (max_width - width0)).round();
        let phase1 = (params.phase1.clamp(-1.0, 1.0) * (max_width - width1)).round();
        Self::from_parts(mix, width0 as u32, width1 as u32, phase1 as i32)
    }

    /// Create a new window shape from raw sample widths and phase.
    pub fn from_parts(mix: f32, width0: u32, width1: u32, phase1: i32) -> Self {
        debug_assert!((0.0..=1.0).contains(&mix));
        debug_assert!(width0 >= 1 && width1 >= 1);
        Self {
            mix,
            width0,
            width1,
            phase1,
        }
    }

    pub fn mix(&self) -> f32 {
        self.mix
    }

    pub fn width0(&self) -> u32 {
        self.width0
    }

    pub fn width1(&self) -> u32 {
        self.width1
    }

    pub fn phase1(&self) -> i32 {
        self.phase1
    }

    /// Inclusive sample span which covers both lobes.
    pub fn range(&self) -> WindowRange {
        let width0 = self.width0 as i64;
        let width1 = self.width1 as i64;
        let phase1 = self.phase1 as i64;
        WindowRange {
            start: (-width0).min(phase1 - width1),
            end: width0.max(phase1 + width1),
        }
    }

    /// Blended envelope value at the given sample offset from the grain center.
    pub fn evaluate(&self, offset: i64) -> f32 {
        let lobe0 = Self::lobe(offset, self.width0);
        let lobe1 = Self::lobe(offset - self.phase1 as i64, self.width1);
        (1.0 - self.mix) * lobe0 + self.mix * lobe1
    }

    /// Combined scaled integer hash of all window fields.
    pub fn hash_value(&self) -> i32 {
        ((self.mix * 1024.0) as i32)
            ^ (self.width0 as i32).wrapping_mul(2)
            ^ (self.width1 as i32).wrapping_mul(3)
            ^ self.phase1
    }

    #[inline]
    fn lobe(offset: i64, width: u32) -> f32 {
        let distance = offset.unsigned_abs();
        if distance >= width as u64 {
            0.0
        } else {
            0.5 + 0.5 * (PI * distance as f32 / width as f32).cos()
        }
    }
}

impl PartialEq for WindowShape {
    fn eq(&self, other: &Self) -> bool {
        self.mix.to_bits() == other.mix.to_bits()
            && self.width0 == other.width0
            && self.width1 == other.width1
            && self.phase1 == other.phase1
    }
}

impl Eq for WindowShape {}

impl Hash for WindowShape {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_value());
    }
}

// -------------------------------------------------------------------------------------------------
