//! Windowed grain waveforms, as produced by the waveform loader workers and consumed by voices.

use std::{
    hash::{Hash, Hasher},
    ops::Range,
};

use crate::{
    error::Error,
    utils::hermite_interpolate,
    window::{WindowRange, WindowShape},
};

// -------------------------------------------------------------------------------------------------

/// Identifies a grain waveform in the waveform cache: a grain, played back with a specific speed
/// ratio and shaped by a specific window.
///
/// Keys compare exactly: keys with speed ratios which differ by less than the hash granularity
/// may collide in hashes, but never compare equal.
#[derive(Debug, Clone, Copy)]
pub struct WaveformKey {
    pub grain: u32,
    pub speed_ratio: f32,
    pub window: WindowShape,
}

impl WaveformKey {
    pub fn new(grain: u32, speed_ratio: f32, window: WindowShape) -> Self {
        Self {
            grain,
            speed_ratio,
            window,
        }
    }

    pub fn hash_value(&self) -> i32 {
        (self.grain as i32) ^ ((self.speed_ratio * 1e3) as i32) ^ self.window.hash_value()
    }
}

impl PartialEq for WaveformKey {
    fn eq(&self, other: &Self) -> bool {
        self.grain == other.grain
            && self.speed_ratio.to_bits() == other.speed_ratio.to_bits()
            && self.window == other.window
    }
}

impl Eq for WaveformKey {}

impl Hash for WaveformKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_value());
    }
}

// -------------------------------------------------------------------------------------------------

/// Options to control how grain waveforms are built.
#[derive(Debug, Clone, Copy)]
pub struct WaveformOptions {
    /// When set, grains are scaled to `target_rms`. Else grains keep their original level.
    /// By default false.
    pub normalize: bool,
    /// Linear target RMS value of normalized grains. By default 0.125 (-18 dBFS).
    pub target_rms: f32,
    /// Max linear gain normalization applies to quiet grains. By default 16 (+24 dB).
    pub max_normalize_gain: f32,
}

impl Default for WaveformOptions {
    fn default() -> Self {
        Self {
            normalize: false,
            target_rms: 0.125,
            max_normalize_gain: 16.0,
        }
    }
}

impl WaveformOptions {
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn target_rms(mut self, target_rms: f32) -> Self {
        self.target_rms = target_rms;
        self
    }

    pub fn max_normalize_gain(mut self, max_normalize_gain: f32) -> Self {
        self.max_normalize_gain = max_normalize_gain;
        self
    }

    /// Validate all parameters. Returns `Error::ParameterError` on errors.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.target_rms > 0.0 && self.target_rms <= 1.0) {
            return Err(Error::ParameterError(format!(
                "target rms must be in range (0, 1], but is {}",
                self.target_rms
            )));
        }
        if !(self.max_normalize_gain >= 1.0 && self.max_normalize_gain.is_finite()) {
            return Err(Error::ParameterError(format!(
                "max normalize gain must be a finite value >= 1, but is {}",
                self.max_normalize_gain
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// A windowed, interleaved grain sample buffer. Immutable once created.
#[derive(Debug, Clone)]
pub struct GrainWaveform {
    key: WaveformKey,
    channel_count: usize,
    buffer: Box<[f32]>,
    rms: f32,
}

impl GrainWaveform {
    /// Create a silent waveform for the given key. Used when a grain failed to load.
    pub fn silent(key: WaveformKey, channel_count: usize) -> Self {
        let buffer = vec![0.0; key.window.range().len() * channel_count].into_boxed_slice();
        Self {
            key,
            channel_count,
            buffer,
            rms: 0.0,
        }
    }

    /// Create a new waveform from unwindowed interleaved sample frames, which cover the key's
    /// window range. Applies the window and measures the RMS, then applies normalization, if
    /// enabled in the given options.
    pub fn from_frames(
        key: WaveformKey,
        channel_count: usize,
        mut buffer: Vec<f32>,
        options: &WaveformOptions,
    ) -> Self {
        let range = key.window.range();
        debug_assert!(channel_count > 0);
        debug_assert_eq!(buffer.len(), range.len() * channel_count);

        let mut square_sum = 0.0f64;
        for (frame, offset) in buffer
            .chunks_exact_mut(channel_count)
            .zip(range.start..=range.end)
        {
            let gain = key.window.evaluate(offset);
            for sample in frame {
                *sample *= gain;
                square_sum += (*sample as f64) * (*sample as f64);
            }
        }
        let rms = if buffer.is_empty() {
            0.0
        } else {
            (square_sum / buffer.len() as f64).sqrt() as f32
        };

        let mut waveform = Self {
            key,
            channel_count,
            buffer: buffer.into_boxed_slice(),
            rms,
        };
        if options.normalize {
            waveform.normalize(options.target_rms, options.max_normalize_gain);
        }
        waveform
    }

    pub fn key(&self) -> &WaveformKey {
        &self.key
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn frame_count(&self) -> usize {
        self.buffer.len() / self.channel_count.max(1)
    }

    /// Window range the waveform's frames are covering, relative to the grain center.
    pub fn range(&self) -> WindowRange {
        self.key.window.range()
    }

    /// Interleaved, windowed samples.
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// RMS of the windowed samples, measured before normalization.
    pub fn rms(&self) -> f32 {
        self.rms
    }

    fn normalize(&mut self, target_rms: f32, max_gain: f32) {
        if self.rms > 0.0 {
            let gain = (target_rms / self.rms).min(max_gain);
            for sample in self.buffer.iter_mut() {
                *sample *= gain;
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Source frame position of the given output window offset.
#[inline]
fn source_position(center: u64, offset: i64, speed_ratio: f32) -> f64 {
    center as f64 + offset as f64 * speed_ratio as f64
}

/// Frame range of the source sound which must be read to resample a grain with the given
/// window range and speed ratio. Includes the extra frames the interpolator needs, so the range
/// may exceed the source sound's frame range.
pub fn source_frame_range(center: u64, range: WindowRange, speed_ratio: f32) -> Range<i64> {
    let start = source_position(center, range.start, speed_ratio).floor() as i64 - 1;
    let end = source_position(center, range.end, speed_ratio).ceil() as i64 + 3;
    start..end
}

/// Resample interleaved source frames, which start at source frame `source_start`, into the
/// output buffer, which covers the given window range around `center`, with 4-point Hermite
/// interpolation. Frames outside of the source buffer are treated as silence.
pub fn resample_frames(
    source: &[f32],
    source_start: i64,
    center: u64,
    range: WindowRange,
    speed_ratio: f32,
    channel_count: usize,
    output: &mut [f32],
) {
    debug_assert!(source.len() % channel_count == 0);
    debug_assert_eq!(output.len(), range.len() * channel_count);
    let source_frames = (source.len() / channel_count) as i64;
    let sample = |frame: i64, channel: usize| -> f32 {
        if (0..source_frames).contains(&frame) {
            source[frame as usize * channel_count + channel]
        } else {
            0.0
        }
    };
    for (frame, offset) in output
        .chunks_exact_mut(channel_count)
        .zip(range.start..=range.end)
    {
        let position = source_position(center, offset, speed_ratio);
        let index = position.floor();
        let fraction = (position - index) as f32;
        let index = index as i64 - source_start;
        for (channel, value) in frame.iter_mut().enumerate() {
            *value = hermite_interpolate(
                sample(index - 1, channel),
                sample(index, channel),
                sample(index + 1, channel),
                sample(index + 2, channel),
                fraction,
            );
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn keys() {
        let window = WindowShape::from_parts(0.5, 10, 20, 5);
        let key = WaveformKey::new(7, 1.0, window);
        assert_eq!(key, WaveformKey::new(7, 1.0, window));
        assert_eq!(hash_of(&key), hash_of(&WaveformKey::new(7, 1.0, window)));
        assert_eq!(key.hash_value(), 7 ^ 1000 ^ window.hash_value());

        assert_ne!(key, WaveformKey::new(8, 1.0, window));
        assert_ne!(
            key,
            WaveformKey::new(7, 1.0, WindowShape::from_parts(0.5, 10, 20, 6))
        );

        // speed ratios below the hash granularity collide, but are not equal
        let other = WaveformKey::new(7, 1.0 + 1e-6, window);
        assert_eq!(key.hash_value(), other.hash_value());
        assert_ne!(key, other);
    }

    #[test]
    fn options() {
        assert!(WaveformOptions::default().validate().is_ok());
        assert!(WaveformOptions::default().target_rms(0.0).validate().is_err());
        assert!(WaveformOptions::default()
            .max_normalize_gain(0.5)
            .validate()
            .is_err());
        assert!(WaveformOptions::default()
            .max_normalize_gain(f32::INFINITY)
            .validate()
            .is_err());
    }

    #[test]
    fn windowing() {
        let window = WindowShape::from_parts(0.0, 4, 4, 0);
        let key = WaveformKey::new(0, 1.0, window);
        let frames = window.range().len();
        let waveform = GrainWaveform::from_frames(
            key,
            2,
            vec![1.0; frames * 2],
            &WaveformOptions::default(),
        );
        assert_eq!(waveform.frame_count(), 9);
        assert_eq!(waveform.channel_count(), 2);
        let buffer = waveform.buffer();
        // edges are silent, center is untouched
        assert_eq!(&buffer[0..2], &[0.0, 0.0]);
        assert_eq!(&buffer[16..18], &[0.0, 0.0]);
        assert_eq!(&buffer[8..10], &[1.0, 1.0]);
        for frame in buffer.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(waveform.rms() > 0.0 && waveform.rms() < 1.0);

        let silent = GrainWaveform::silent(key, 2);
        assert_eq!(silent.frame_count(), 9);
        assert_eq!(silent.rms(), 0.0);
        assert!(silent.buffer().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn normalization() {
        let window = WindowShape::from_parts(0.5, 8, 8, 0);
        let key = WaveformKey::new(0, 1.0, window);
        let frames = window.range().len();
        let quiet = vec![0.01; frames];

        let plain = GrainWaveform::from_frames(key, 1, quiet.clone(), &WaveformOptions::default());
        let options = WaveformOptions::default().normalize(true).target_rms(0.05);
        let normalized = GrainWaveform::from_frames(key, 1, quiet.clone(), &options);
        // rms is measured before normalization
        assert_eq!(plain.rms(), normalized.rms());
        let gain = normalized.buffer()[8] / plain.buffer()[8];
        assert!((gain - 0.05 / plain.rms()).abs() < 1e-3);

        // gain is capped
        let options = options.max_normalize_gain(2.0);
        let capped = GrainWaveform::from_frames(key, 1, quiet, &options);
        assert!((capped.buffer()[8] - 2.0 * plain.buffer()[8]).abs() < 1e-6);

        // silence stays silent
        let silent = GrainWaveform::from_frames(key, 1, vec![0.0; frames], &options);
        assert!(silent.buffer().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn resampling() {
        let range = WindowRange { start: -4, end: 4 };
        let source = (0..100).map(|i| i as f32).collect::<Vec<_>>();

        // unity speed copies frames
        let mut output = vec![0.0; range.len()];
        resample_frames(&source, 0, 50, range, 1.0, 1, &mut output);
        assert_eq!(output, (46..=54).map(|i| i as f32).collect::<Vec<_>>());

        // double speed skips frames, half speed interpolates linear ramps linearly
        resample_frames(&source, 0, 50, range, 2.0, 1, &mut output);
        assert_eq!(output, (0..9).map(|i| 42.0 + 2.0 * i as f32).collect::<Vec<_>>());
        resample_frames(&source, 10, 50, range, 0.5, 1, &mut output);
        for (i, value) in output.iter().enumerate() {
            let expected = 38.0 + 0.5 * i as f32;
            assert!((value - expected).abs() < 1e-4, "{value} != {expected}");
        }

        // frames outside of the source are silent
        resample_frames(&source, 0, 2, range, 1.0, 1, &mut output);
        assert_eq!(&output[..2], &[0.0, 0.0]);
        assert_eq!(output[2], 0.0);
        assert_eq!(output[3], 1.0);

        // the source frame range covers all frames which are needed for interpolation
        let frames = source_frame_range(50, range, 2.0);
        assert_eq!(frames, 41..61);
        let frames = source_frame_range(50, range, 1.0);
        assert_eq!(frames, 45..57);
    }
}
