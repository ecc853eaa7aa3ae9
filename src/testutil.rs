//! Test fixtures: a minimal ZIP writer and grain container builder.

use std::{
    io::{Cursor, Write},
    thread,
    time::{Duration, Instant},
};

use byteorder::{LittleEndian, WriteBytesExt};
use flacenc::{component::BitRepr, error::Verify};
use flate2::{write::DeflateEncoder, Compression, Crc};
use tempfile::NamedTempFile;

// -------------------------------------------------------------------------------------------------

// Counts allocations in `assert_no_alloc` scopes of test threads.
#[cfg(feature = "assert-allocs")]
#[global_allocator]
static A: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;

// -------------------------------------------------------------------------------------------------

/// Log to stdout in tests. Can be called multiple times: only the first call installs a logger.
pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// Wait for the given predicate to return true or fail.
pub fn eventually<F>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let tick = Duration::from_millis(1);
    let timeout = Duration::from_secs(10);

    loop {
        if predicate() {
            return;
        }
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        thread::sleep(tick);
    }
}

// -------------------------------------------------------------------------------------------------

/// Write the given bytes into a new temporary file.
pub fn write_temp_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(bytes).expect("failed to write temp file");
    file.flush().expect("failed to flush temp file");
    file
}

// -------------------------------------------------------------------------------------------------

struct ZipBuilderEntry {
    name: String,
    content: Vec<u8>,
    deflate: bool,
}

/// Writes single disk ZIP archives with stored or deflated entries, optionally with ZIP64
/// records only (all 32-bit size and offset fields saturated).
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<ZipBuilderEntry>,
    zip64: bool,
    comment: Vec<u8>,
    compression_method: Option<u16>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push(ZipBuilderEntry {
            name: name.to_string(),
            content: content.to_vec(),
            deflate: false,
        });
        self
    }

    pub fn deflated(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push(ZipBuilderEntry {
            name: name.to_string(),
            content: content.to_vec(),
            deflate: true,
        });
        self
    }

    pub fn zip64(mut self, zip64: bool) -> Self {
        self.zip64 = zip64;
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Force the given compression method in all central directory headers.
    pub fn compression_method(mut self, method: u16) -> Self {
        self.compression_method = Some(method);
        self
    }

    pub fn build(self) -> Vec<u8> {
        const MARKER: u32 = 0xFFFF_FFFF;
        let mut out = Vec::new();
        let mut central = Vec::new();

        for entry in &self.entries {
            let data = if entry.deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(&entry.content).unwrap();
                encoder.finish().unwrap()
            } else {
                entry.content.clone()
            };
            let method = if entry.deflate { 8u16 } else { 0u16 };
            let mut crc = Crc::new();
            crc.update(&entry.content);
            let local_offset = out.len() as u64;
            let name = entry.name.as_bytes();

            // local header: carries a ZIP64 extra field in ZIP64 mode too, so the data offset
            // must be resolved from the variable header length
            let mut local_extra = Vec::new();
            if self.zip64 {
                local_extra.write_u16::<LittleEndian>(0x0001).unwrap();
                local_extra.write_u16::<LittleEndian>(16).unwrap();
                local_extra
                    .write_u64::<LittleEndian>(entry.content.len() as u64)
                    .unwrap();
                local_extra
                    .write_u64::<LittleEndian>(data.len() as u64)
                    .unwrap();
            }
            let (local_compressed, local_uncompressed) = if self.zip64 {
                (MARKER, MARKER)
            } else {
                (data.len() as u32, entry.content.len() as u32)
            };
            out.write_u32::<LittleEndian>(0x04034b50).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(method).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(crc.sum()).unwrap();
            out.write_u32::<LittleEndian>(local_compressed).unwrap();
            out.write_u32::<LittleEndian>(local_uncompressed).unwrap();
            out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            out.write_u16::<LittleEndian>(local_extra.len() as u16)
                .unwrap();
            out.extend_from_slice(name);
            out.extend_from_slice(&local_extra);
            out.extend_from_slice(&data);

            // central directory header
            let mut central_extra = Vec::new();
            let (compressed, uncompressed, offset) = if self.zip64 {
                central_extra.write_u16::<LittleEndian>(0x0001).unwrap();
                central_extra.write_u16::<LittleEndian>(24).unwrap();
                central_extra
                    .write_u64::<LittleEndian>(entry.content.len() as u64)
                    .unwrap();
                central_extra
                    .write_u64::<LittleEndian>(data.len() as u64)
                    .unwrap();
                central_extra.write_u64::<LittleEndian>(local_offset).unwrap();
                (MARKER, MARKER, MARKER)
            } else {
                (
                    data.len() as u32,
                    entry.content.len() as u32,
                    local_offset as u32,
                )
            };
            central.write_u32::<LittleEndian>(0x02014b50).unwrap();
            central.write_u16::<LittleEndian>(45).unwrap();
            central.write_u16::<LittleEndian>(45).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central
                .write_u16::<LittleEndian>(self.compression_method.unwrap_or(method))
                .unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(crc.sum()).unwrap();
            central.write_u32::<LittleEndian>(compressed).unwrap();
            central.write_u32::<LittleEndian>(uncompressed).unwrap();
            central.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            central
                .write_u16::<LittleEndian>(central_extra.len() as u16)
                .unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(offset).unwrap();
            central.extend_from_slice(name);
            central.extend_from_slice(&central_extra);
        }

        let dir_offset = out.len() as u64;
        let dir_size = central.len() as u64;
        let num_entries = self.entries.len() as u64;
        out.extend_from_slice(&central);

        if self.zip64 {
            let eocd64_offset = out.len() as u64;
            out.write_u32::<LittleEndian>(0x06064b50).unwrap();
            out.write_u64::<LittleEndian>(44).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(num_entries).unwrap();
            out.write_u64::<LittleEndian>(num_entries).unwrap();
            out.write_u64::<LittleEndian>(dir_size).unwrap();
            out.write_u64::<LittleEndian>(dir_offset).unwrap();

            out.write_u32::<LittleEndian>(0x07064b50).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(eocd64_offset).unwrap();
            out.write_u32::<LittleEndian>(1).unwrap();
        }

        let (eocd_entries, eocd_size, eocd_offset) = if self.zip64 {
            (0xFFFF, MARKER, MARKER)
        } else {
            (num_entries as u16, dir_size as u32, dir_offset as u32)
        };
        out.write_u32::<LittleEndian>(0x06054b50).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(eocd_entries).unwrap();
        out.write_u16::<LittleEndian>(eocd_entries).unwrap();
        out.write_u32::<LittleEndian>(eocd_size).unwrap();
        out.write_u32::<LittleEndian>(eocd_offset).unwrap();
        out.write_u16::<LittleEndian>(self.comment.len() as u16)
            .unwrap();
        out.extend_from_slice(&self.comment);
        out
    }
}

// -------------------------------------------------------------------------------------------------

/// Encode the given mono samples as a 16-bit PCM WAV stream.
///
/// Symphonia probes the embedded sound stream's format from its content, so WAV streams decode
/// through the same path as FLAC ones.
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Encode the given mono samples as a 16-bit FLAC stream.
pub fn flac_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let config = flacenc::config::Encoder::default()
        .into_verified()
        .expect("invalid flac encoder config");
    let samples = samples.iter().map(|s| *s as i32).collect::<Vec<_>>();
    let source = flacenc::source::MemSource::from_samples(&samples, 1, 16, sample_rate as usize);
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .expect("failed to encode flac stream");
    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .expect("failed to write flac stream");
    sink.into_inner()
}

// -------------------------------------------------------------------------------------------------

/// Describes the content of a grain container fixture.
#[derive(Clone)]
pub struct GrainContainerSpec {
    pub sample_rate: u32,
    pub max_grain_width: f32,
    pub grain_offsets: Vec<u64>,
    pub bin_boundaries: Vec<u64>,
    pub bin_pitches: Vec<f32>,
    pub samples: Vec<i16>,
    pub zip64: bool,
    /// Embed the sound as FLAC instead of WAV.
    pub flac: bool,
}

impl Default for GrainContainerSpec {
    /// 100 grains in 4 bins at 100, 200, 400 and 800 Hz.
    fn default() -> Self {
        let sample_rate = 1000;
        let samples = (0..4000)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect::<Vec<i16>>();
        Self {
            sample_rate,
            max_grain_width: 0.01,
            grain_offsets: (0..100).map(|i| 100 + i * 30).collect(),
            bin_boundaries: vec![0, 25, 50, 75, 100],
            bin_pitches: vec![100.0, 200.0, 400.0, 800.0],
            samples,
            zip64: false,
            flac: false,
        }
    }
}

impl GrainContainerSpec {
    pub fn index_json(&self) -> String {
        format!(
            r#"{{"sound_len": {}, "max_grain_width": {}, "sample_rate": {}, "bin_x": {:?}, "bin_f0": {:?}}}"#,
            self.samples.len(),
            self.max_grain_width,
            self.sample_rate,
            self.bin_boundaries,
            self.bin_pitches
        )
    }

    pub fn grain_offsets_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.grain_offsets.len() * 8);
        for offset in &self.grain_offsets {
            bytes.write_u64::<LittleEndian>(*offset).unwrap();
        }
        bytes
    }

    pub fn sound_bytes(&self) -> Vec<u8> {
        if self.flac {
            flac_bytes(&self.samples, self.sample_rate)
        } else {
            wav_bytes(&self.samples, self.sample_rate)
        }
    }

    /// Container builder with all three entries.
    pub fn zip_builder(&self) -> ZipBuilder {
        ZipBuilder::new()
            .zip64(self.zip64)
            .deflated("index.json", self.index_json().as_bytes())
            .deflated("grains.u64", &self.grain_offsets_bytes())
            .stored("sound.flac", &self.sound_bytes())
    }

    pub fn write(&self) -> NamedTempFile {
        write_temp_file(&self.zip_builder().build())
    }
}
