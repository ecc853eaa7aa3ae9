use std::{io, ops::Range, path::Path};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
    units::TimeStamp,
};

use crate::{container::ContainerRangeReader, error::Error};

// -------------------------------------------------------------------------------------------------

impl MediaSource for ContainerRangeReader {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len())
    }
}

// -------------------------------------------------------------------------------------------------

/// Decodes sample frames at random positions from the sound stream embedded in a grain container.
pub struct AudioDecoder {
    track_id: u32, // Internal track index.
    decoder: Box<dyn Decoder>,
    format: Box<dyn FormatReader>,
    channel_count: usize,
    sample_rate: u32,
    /// Interleaved samples of the last decoded packet.
    packet: Option<SampleBuffer<f32>>,
    /// Frame range of the last decoded packet. `None` when the stream position is unknown.
    packet_frames: Option<Range<u64>>,
}

impl AudioDecoder {
    /// Create a new decoder for the stream stored in the given byte range of the container file.
    /// Stream positions are relative to the byte range, not to the container file.
    pub fn from_container_range<P: AsRef<Path>>(path: P, range: Range<u64>) -> Result<Self, Error> {
        let reader = ContainerRangeReader::new(path, range)?;
        let source_stream = MediaSourceStream::new(Box::new(reader), Default::default());
        Self::from_source_stream(source_stream)
    }

    /// Create a new decoder from the given Symphonia MediaSourceStream
    pub fn from_source_stream(source_stream: MediaSourceStream) -> Result<Self, Error> {
        // Embedded streams are FLAC streams. Formats are probed from the content, though.
        let mut hint = Hint::new();
        hint.with_extension("flac");

        // Use the default options when reading and decoding.
        let format_opts: FormatOptions = Default::default();
        let metadata_opts: MetadataOptions = Default::default();
        let decoder_opts: DecoderOptions = Default::default();

        // Probe the media source stream for a format.
        let probed = symphonia::default::get_probe().format(
            &hint,
            source_stream,
            &format_opts,
            &metadata_opts,
        )?;

        // Get the format reader yielded by the probe operation.
        let format = probed.format;

        // Get the default track.
        let track = format.default_track().ok_or_else(|| {
            Error::DecodeError("Embedded sound stream contains no audio track".into())
        })?;
        let track_id = track.id;

        let channel_count = track
            .codec_params
            .channels
            .map(|channels| channels.count())
            .unwrap_or(0);
        let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
        if channel_count == 0 || sample_rate == 0 {
            return Err(Error::DecodeError(
                "Embedded sound stream has an unknown signal spec".into(),
            ));
        }

        // Create a decoder for the track.
        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &decoder_opts)?;

        Ok(Self {
            track_id,
            decoder,
            format,
            channel_count,
            sample_rate,
            packet: None,
            packet_frames: Some(0..0),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seek to the given frame position. Returns the frame position the decoder actually
    /// seeked to, which may be before the requested one.
    pub fn seek(&mut self, frame: u64) -> Result<TimeStamp, Error> {
        let seeked_to = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();
        self.packet_frames = None;
        Ok(seeked_to.actual_ts)
    }

    /// Read interleaved frames, starting at the given frame position, into the given output
    /// buffer. Returns the number of frames that were read, which is less than requested when the
    /// stream ended.
    pub fn read_frames(&mut self, start: u64, output: &mut [f32]) -> Result<usize, Error> {
        let channel_count = self.channel_count;
        debug_assert!(output.len() % channel_count == 0);
        let end = start + (output.len() / channel_count) as u64;
        if start >= end {
            return Ok(0);
        }

        // continue reading from the current packet when possible, else seek
        let is_sequential = self
            .packet_frames
            .as_ref()
            .is_some_and(|frames| frames.start <= start && start <= frames.end);
        if !is_sequential {
            self.seek(start)?;
        }

        let mut frames_read = 0;
        let mut position = start;
        loop {
            // copy intersection of the current packet with the remaining range
            if let (Some(frames), Some(packet)) = (&self.packet_frames, &self.packet) {
                if frames.contains(&position) {
                    let copy_end = end.min(frames.end);
                    let source = &packet.samples()[(position - frames.start) as usize
                        * channel_count
                        ..(copy_end - frames.start) as usize * channel_count];
                    let target = &mut output[(position - start) as usize * channel_count
                        ..(copy_end - start) as usize * channel_count];
                    target.copy_from_slice(source);
                    frames_read += (copy_end - position) as usize;
                    position = copy_end;
                }
            }
            if position >= end || !self.read_packet()? {
                break;
            }
            if self
                .packet_frames
                .as_ref()
                .is_some_and(|frames| frames.start > position)
            {
                // seeked or decoded past the requested position
                break;
            }
        }
        Ok(frames_read)
    }

    /// Read the next packet of audio from the stream into our packet buffer.
    /// Returns `false` in case of EOF.
    fn read_packet(&mut self) -> Result<bool, Error> {
        loop {
            // Demux an encoded packet from the media format.
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(io)) if io.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false); // End of this stream.
                }
                Err(err) => {
                    return Err(err.into()); // We cannot recover from format errors, quit.
                }
            };
            // If the packet does not belong to the selected track, skip over it.
            if packet.track_id() != self.track_id {
                continue;
            }
            // Decode the packet into an audio buffer.
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let required_capacity = decoded.capacity() * decoded.spec().channels.count();
                    if self
                        .packet
                        .as_ref()
                        .is_none_or(|buffer| buffer.capacity() < required_capacity)
                    {
                        self.packet = None;
                    }
                    let buffer = self.packet.get_or_insert_with(|| {
                        SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                    });
                    // Interleave the samples into the buffer.
                    buffer.copy_interleaved_ref(decoded);
                    let frame_count = (buffer.len() / self.channel_count) as u64;
                    self.packet_frames = Some(packet.ts()..packet.ts() + frame_count);
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    // The packet failed to decode due to invalid data, skip the packet.
                    log::warn!("Grain decode error: {err}");
                    self.packet_frames = None;
                    continue;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };
        }
    }
}

// -------------------------------------------------------------------------------------------------
