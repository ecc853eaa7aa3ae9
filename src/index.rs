//! Pitch/grain index of a packed grain container.

use std::{
    fmt,
    io,
    ops::Range,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::{container::Container, error::Error, utils::unique_usize_id};

// -------------------------------------------------------------------------------------------------

/// Name of the JSON metadata entry in grain containers.
pub const INDEX_ENTRY_NAME: &str = "index.json";
/// Name of the binary grain offset table entry in grain containers.
pub const GRAINS_ENTRY_NAME: &str = "grains.u64";
/// Name of the embedded sound stream entry in grain containers.
pub const SOUND_ENTRY_NAME: &str = "sound.flac";

// -------------------------------------------------------------------------------------------------

/// Raw content of the container's JSON metadata entry.
#[derive(Debug, Clone, Deserialize)]
struct IndexMetadata {
    sound_len: u64,
    max_grain_width: f32,
    sample_rate: u32,
    bin_x: Vec<u64>,
    bin_f0: Vec<f32>,
}

// -------------------------------------------------------------------------------------------------

/// Validated, immutable grain index of a grain container.
///
/// Grains are short snippets of the container's embedded sound, located by their center sample
/// offset. Grains are grouped into bins of similar pitch, and bins are sorted by ascending pitch.
///
/// Indices are shared via `Arc`s between the index loader, the waveform cache and playing
/// voices: an index stays alive until the last of them releases it.
#[derive(Debug, Clone)]
pub struct GrainIndex {
    id: usize,
    path: PathBuf,
    sample_rate: u32,
    max_grain_width: f32,
    num_samples: u64,
    sound_file_bytes: Range<u64>,
    grain_offsets: Vec<u64>,
    bin_boundaries: Vec<usize>,
    bin_pitches: Vec<f32>,
}

impl GrainIndex {
    /// Load and validate the grain index of the container at the given path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                "No grain data file",
            )));
        }

        let container = Container::open(path)?;

        // JSON metadata
        if container.entry(INDEX_ENTRY_NAME).is_none() {
            return Err(Error::FormatError(
                "Missing grain index metadata".to_string(),
            ));
        }
        let metadata: IndexMetadata =
            serde_json::from_slice(&container.read_entry(INDEX_ENTRY_NAME)?)?;

        // grain offset table: it's large, so it lives in a separate binary entry
        if container.entry(GRAINS_ENTRY_NAME).is_none() {
            return Err(Error::FormatError("Missing grain offset table".to_string()));
        }
        let grain_bytes = container.read_entry(GRAINS_ENTRY_NAME)?;
        if grain_bytes.is_empty() {
            return Err(Error::FormatError("Empty grain offset table".to_string()));
        }
        if grain_bytes.len() % 8 != 0 {
            return Err(Error::FormatError(
                "Grain offset table size is not a multiple of 8 bytes".to_string(),
            ));
        }
        let mut grain_offsets = vec![0u64; grain_bytes.len() / 8];
        LittleEndian::read_u64_into(&grain_bytes, &mut grain_offsets);

        // embedded sound stream: must be stored, so it can be read in place
        let sound_file_bytes = container.byte_range(SOUND_ENTRY_NAME).ok_or_else(|| {
            Error::FormatError("Missing or compressed embedded sound stream".to_string())
        })?;

        Self::new(
            path.to_path_buf(),
            metadata.sample_rate,
            metadata.max_grain_width,
            metadata.sound_len,
            sound_file_bytes,
            grain_offsets,
            metadata.bin_x,
            metadata.bin_f0,
        )
    }

    /// Create a new index from its raw parts, validating all index invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: PathBuf,
        sample_rate: u32,
        max_grain_width: f32,
        num_samples: u64,
        sound_file_bytes: Range<u64>,
        grain_offsets: Vec<u64>,
        bin_boundaries: Vec<u64>,
        bin_pitches: Vec<f32>,
    ) -> Result<Self, Error> {
        if sample_rate < 1 {
            return Err(Error::ValidationError(
                "Sample rate must be at least 1 Hz".to_string(),
            ));
        }
        if !(max_grain_width * sample_rate as f32 >= 1.0) {
            return Err(Error::ValidationError(
                "Max grain width must be at least one sample".to_string(),
            ));
        }
        if num_samples < 1 {
            return Err(Error::ValidationError(
                "Sound must contain at least one sample".to_string(),
            ));
        }
        if grain_offsets.is_empty() {
            return Err(Error::ValidationError(
                "Index must contain at least one grain".to_string(),
            ));
        }
        if grain_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::ValidationError(
                "Grain offsets must be sorted".to_string(),
            ));
        }
        if bin_pitches.is_empty() {
            return Err(Error::ValidationError(
                "Index must contain at least one bin".to_string(),
            ));
        }
        if bin_boundaries.len() != bin_pitches.len() + 1 {
            return Err(Error::ValidationError(format!(
                "Expected {} bin boundaries for {} bins, got {}",
                bin_pitches.len() + 1,
                bin_pitches.len(),
                bin_boundaries.len()
            )));
        }
        let num_grains = grain_offsets.len() as u64;
        if bin_boundaries.windows(2).any(|w| w[0] > w[1])
            || bin_boundaries.last().is_some_and(|last| *last > num_grains)
        {
            return Err(Error::ValidationError(
                "Bin boundaries must be sorted grain indices".to_string(),
            ));
        }
        if bin_pitches.iter().any(|p| !p.is_finite())
            || bin_pitches.windows(2).any(|w| w[0] > w[1])
        {
            return Err(Error::ValidationError(
                "Bin pitches must be sorted and finite".to_string(),
            ));
        }
        if sound_file_bytes.is_empty() {
            return Err(Error::ValidationError(
                "Embedded sound stream is empty".to_string(),
            ));
        }

        let id = unique_usize_id();
        let bin_boundaries = bin_boundaries.into_iter().map(|b| b as usize).collect();
        Ok(Self {
            id,
            path,
            sample_rate,
            max_grain_width,
            num_samples,
            sound_file_bytes,
            grain_offsets,
            bin_boundaries,
            bin_pitches,
        })
    }

    /// Process-unique id of this index: every load creates a new id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Path of the container this index got loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Max grain width in seconds.
    pub fn max_grain_width(&self) -> f32 {
        self.max_grain_width
    }

    pub fn max_grain_width_samples(&self) -> f32 {
        self.max_grain_width * self.sample_rate as f32
    }

    /// Total number of sample frames in the embedded sound.
    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Byte range of the embedded sound stream within the container file.
    pub fn sound_file_bytes(&self) -> Range<u64> {
        self.sound_file_bytes.clone()
    }

    pub fn num_grains(&self) -> usize {
        self.grain_offsets.len()
    }

    pub fn num_bins(&self) -> usize {
        self.bin_pitches.len()
    }

    pub fn grain_offsets(&self) -> &[u64] {
        &self.grain_offsets
    }

    pub fn bin_boundaries(&self) -> &[usize] {
        &self.bin_boundaries
    }

    pub fn bin_pitches(&self) -> &[f32] {
        &self.bin_pitches
    }

    /// Center sample frame of the given grain in the embedded sound.
    pub fn center_sample_for_grain(&self, grain: usize) -> Option<u64> {
        self.grain_offsets.get(grain).copied()
    }

    /// Representative pitch in Hz of the given bin.
    pub fn pitch_for_bin(&self, bin: usize) -> Option<f32> {
        self.bin_pitches.get(bin).copied()
    }

    /// Range of grain indices in the given bin. Out of range bins yield an empty range.
    pub fn grains_for_bin(&self, bin: usize) -> Range<usize> {
        if bin >= self.num_bins() {
            return 0..0;
        }
        let num_grains = self.num_grains();
        let start = self.bin_boundaries[bin].min(num_grains);
        let end = self.bin_boundaries[bin + 1].min(num_grains);
        start..end
    }

    /// Lowest and highest bin pitch in Hz.
    pub fn pitch_range(&self) -> Range<f32> {
        self.bin_pitches[0]..self.bin_pitches[self.bin_pitches.len() - 1]
    }

    /// Find the bin with the pitch which is closest to the given frequency in Hz.
    /// When two bins are equally close, the lower one is chosen.
    pub fn closest_bin_for_pitch(&self, hz: f32) -> usize {
        let pitches = &self.bin_pitches;
        // first bin with a pitch >= hz
        let upper = pitches.partition_point(|pitch| *pitch < hz);
        if upper == 0 {
            0
        } else if upper >= pitches.len() {
            pitches.len() - 1
        } else {
            let lower = upper - 1;
            if pitches[upper] - hz < hz - pitches[lower] {
                upper
            } else {
                lower
            }
        }
    }

    /// Human readable, short display string for the given sample count.
    pub fn num_samples_to_string(samples: u64) -> String {
        const UNITS: [(&str, f64, usize); 5] = [
            ("tera", 1e12, 2),
            ("giga", 1e9, 2),
            ("mega", 1e6, 1),
            ("kilo", 1e3, 1),
            ("", 1.0, 0),
        ];
        let (prefix, scale, precision) = UNITS
            .iter()
            .find(|(_, scale, precision)| samples as f64 >= *scale || *precision == 0)
            .copied()
            .unwrap_or(UNITS[UNITS.len() - 1]);
        format!(
            "{:.*} {}samples",
            precision,
            samples as f64 / scale,
            prefix
        )
    }
}

impl fmt::Display for GrainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pitch_range = self.pitch_range();
        write!(
            f,
            "{} grains, {} bins, {:.1} sec, {:.1} - {:.1} Hz, {}",
            self.num_grains(),
            self.num_bins(),
            self.max_grain_width,
            pitch_range.start,
            pitch_range.end,
            Self::num_samples_to_string(self.num_samples)
        )
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wav_bytes, write_temp_file, GrainContainerSpec, ZipBuilder};

    fn test_index() -> GrainIndex {
        GrainIndex::new(
            PathBuf::from("test.rvv"),
            1000,
            0.01,
            4000,
            100..200,
            (0..100).collect(),
            vec![0, 25, 50, 75, 100],
            vec![100.0, 200.0, 400.0, 800.0],
        )
        .unwrap()
    }

    #[test]
    fn load() {
        let spec = GrainContainerSpec::default();
        let file = spec.write();
        let index = GrainIndex::load(file.path()).unwrap();
        assert_eq!(index.num_grains(), 100);
        assert_eq!(index.num_bins(), 4);
        assert_eq!(index.sample_rate(), 1000);
        assert_eq!(index.num_samples(), 4000);
        assert_eq!(index.max_grain_width_samples(), 10.0);
        assert_eq!(index.grain_offsets(), spec.grain_offsets.as_slice());
        assert_eq!(index.center_sample_for_grain(1), Some(130));
        assert_eq!(index.center_sample_for_grain(100), None);
        assert_eq!(index.grains_for_bin(1), 25..50);
        assert_eq!(index.grains_for_bin(4), 0..0);
        assert_eq!(index.pitch_for_bin(3), Some(800.0));
        assert!(!index.sound_file_bytes().is_empty());

        // loading again yields identical contents, but a new identity
        let other = GrainIndex::load(file.path()).unwrap();
        assert_eq!(other.num_grains(), index.num_grains());
        assert_eq!(other.num_bins(), index.num_bins());
        assert_eq!(other.sound_file_bytes(), index.sound_file_bytes());
        assert_eq!(other.to_string(), index.to_string());
        assert_ne!(other.id(), index.id());
    }

    #[test]
    fn load_zip64() {
        let spec = GrainContainerSpec {
            zip64: true,
            ..Default::default()
        };
        let file = spec.write();
        let index = GrainIndex::load(file.path()).unwrap();
        assert_eq!(index.num_grains(), 100);
    }

    #[test]
    fn load_failures() {
        let spec = GrainContainerSpec::default();

        // missing file
        assert!(matches!(
            GrainIndex::load("/this/path/does/not/exist.rvv"),
            Err(Error::IoError(_))
        ));

        // missing sound stream
        let file = write_temp_file(
            &ZipBuilder::new()
                .deflated("index.json", spec.index_json().as_bytes())
                .deflated("grains.u64", &spec.grain_offsets_bytes())
                .build(),
        );
        assert!(matches!(
            GrainIndex::load(file.path()),
            Err(Error::FormatError(_))
        ));

        // missing metadata
        let file = write_temp_file(
            &ZipBuilder::new()
                .deflated("grains.u64", &spec.grain_offsets_bytes())
                .stored("sound.flac", &wav_bytes(&spec.samples, spec.sample_rate))
                .build(),
        );
        assert!(matches!(
            GrainIndex::load(file.path()),
            Err(Error::FormatError(_))
        ));

        // malformed metadata
        let file = write_temp_file(
            &spec
                .zip_builder()
                .deflated("index.json", b"{\"sound_len\": [1, 2, 3], \"more\": ")
                .build(),
        );
        assert!(matches!(
            GrainIndex::load(file.path()),
            Err(Error::FormatError(_))
        ));

        // empty grain table
        let file = write_temp_file(
            &ZipBuilder::new()
                .deflated("index.json", spec.index_json().as_bytes())
                .stored("grains.u64", &[])
                .stored("sound.flac", &wav_bytes(&spec.samples, spec.sample_rate))
                .build(),
        );
        assert!(matches!(
            GrainIndex::load(file.path()),
            Err(Error::FormatError(_))
        ));

        // inconsistent bins
        let file = GrainContainerSpec {
            bin_boundaries: vec![0, 50, 100],
            ..Default::default()
        }
        .write();
        assert!(matches!(
            GrainIndex::load(file.path()),
            Err(Error::ValidationError(_))
        ));

        // zero sample rate
        let file = GrainContainerSpec {
            sample_rate: 0,
            ..Default::default()
        }
        .write();
        assert!(GrainIndex::load(file.path()).is_err());
    }

    #[test]
    fn validation() {
        let new = |sample_rate, max_grain_width, num_samples, grains: Vec<u64>, bins| {
            GrainIndex::new(
                PathBuf::new(),
                sample_rate,
                max_grain_width,
                num_samples,
                0..10,
                grains,
                bins,
                vec![100.0, 200.0],
            )
        };
        assert!(new(1000, 0.01, 10, vec![0, 1], vec![0, 1, 2]).is_ok());
        assert!(new(0, 0.01, 10, vec![0, 1], vec![0, 1, 2]).is_err());
        assert!(new(1000, 0.0001, 10, vec![0, 1], vec![0, 1, 2]).is_err());
        assert!(new(1000, f32::NAN, 10, vec![0, 1], vec![0, 1, 2]).is_err());
        assert!(new(1000, 0.01, 0, vec![0, 1], vec![0, 1, 2]).is_err());
        assert!(new(1000, 0.01, 10, vec![], vec![0, 1, 2]).is_err());
        assert!(new(1000, 0.01, 10, vec![1, 0], vec![0, 1, 2]).is_err());
        assert!(new(1000, 0.01, 10, vec![0, 1], vec![0, 2]).is_err());
        assert!(new(1000, 0.01, 10, vec![0, 1], vec![0, 2, 1]).is_err());
        assert!(new(1000, 0.01, 10, vec![0, 1], vec![0, 1, 3]).is_err());
    }

    #[test]
    fn closest_bin_for_pitch() {
        let index = test_index();
        assert_eq!(index.closest_bin_for_pitch(250.0), 1);
        assert_eq!(index.closest_bin_for_pitch(50.0), 0);
        assert_eq!(index.closest_bin_for_pitch(100.0), 0);
        assert_eq!(index.closest_bin_for_pitch(200.0), 1);
        assert_eq!(index.closest_bin_for_pitch(350.0), 2);
        assert_eq!(index.closest_bin_for_pitch(10000.0), 3);
        // ties favor the lower bin
        assert_eq!(index.closest_bin_for_pitch(300.0), 1);

        // monotonic and within half the local bin spacing
        let mut last_bin = 0;
        let mut hz = 20.0f32;
        while hz < 2000.0 {
            let bin = index.closest_bin_for_pitch(hz);
            assert!(bin >= last_bin);
            let pitch = index.pitch_for_bin(bin).unwrap();
            if hz > 100.0 && hz < 800.0 {
                let lower = index.pitch_for_bin(bin.saturating_sub(1)).unwrap();
                let upper = index.pitch_for_bin((bin + 1).min(3)).unwrap();
                let spacing = (upper - pitch).max(pitch - lower);
                assert!((pitch - hz).abs() <= spacing / 2.0 + 1e-3);
            }
            last_bin = bin;
            hz *= 1.01;
        }
    }

    #[test]
    fn describe() {
        let index = test_index();
        assert_eq!(
            index.to_string(),
            "100 grains, 4 bins, 0.0 sec, 100.0 - 800.0 Hz, 4.0 kilosamples"
        );
        assert_eq!(index.to_string(), index.to_string());
    }

    #[test]
    fn num_samples_to_string() {
        assert_eq!(GrainIndex::num_samples_to_string(0), "0 samples");
        assert_eq!(GrainIndex::num_samples_to_string(999), "999 samples");
        assert_eq!(GrainIndex::num_samples_to_string(1000), "1.0 kilosamples");
        assert_eq!(
            GrainIndex::num_samples_to_string(1_500_000),
            "1.5 megasamples"
        );
        assert_eq!(
            GrainIndex::num_samples_to_string(2_345_000_000),
            "2.35 gigasamples"
        );
        assert_eq!(
            GrainIndex::num_samples_to_string(7_000_000_000_000),
            "7.00 terasamples"
        );
    }
}
