use std::{
    ops::Range,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread,
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{
    cache::WaveformStore,
    decoder::AudioDecoder,
    error::Error,
    index::GrainIndex,
    waveform::{resample_frames, source_frame_range, GrainWaveform, WaveformKey, WaveformOptions},
};

// -------------------------------------------------------------------------------------------------

/// A request to decode and window a single grain waveform.
#[derive(Debug, Clone)]
pub struct WaveformJob {
    pub index: Arc<GrainIndex>,
    pub key: WaveformKey,
}

/// Messages sent to a [`WaveformLoaderWorker`] thread.
#[derive(Debug)]
pub enum WaveformLoaderMessage {
    Load(WaveformJob),
    Shutdown,
}

// -------------------------------------------------------------------------------------------------

/// A background thread which decodes requested grain waveforms and publishes them in the
/// waveform cache.
///
/// Each worker processes its own job queue strictly in submission order and sleeps while the
/// queue is empty. After each job, waveforms of grain indices which are no longer used get
/// released, so their memory is freed here and not on the real-time thread.
pub struct WaveformLoaderWorker {
    sender: Sender<WaveformLoaderMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WaveformLoaderWorker {
    pub(crate) fn new(
        worker_id: usize,
        store: Arc<WaveformStore>,
        options: WaveformOptions,
    ) -> Result<Self, Error> {
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name(format!("grainstream-waveform-loader-{worker_id}"))
            .spawn(move || Self::run(worker_id, receiver, store, options))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Append a new job to the worker's queue.
    pub fn add_job(&self, job: WaveformJob) -> Result<(), Error> {
        self.sender.send(WaveformLoaderMessage::Load(job))?;
        Ok(())
    }

    /// Number of jobs which are waiting to get processed.
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    fn run(
        worker_id: usize,
        receiver: Receiver<WaveformLoaderMessage>,
        store: Arc<WaveformStore>,
        options: WaveformOptions,
    ) {
        let mut reader = GrainReader::new(options);
        while let Ok(message) = receiver.recv() {
            match message {
                WaveformLoaderMessage::Load(job) => {
                    if Arc::strong_count(&job.index) == 1 {
                        // no sound uses the index anymore
                        store.cancel(job.index.id(), &job.key);
                        continue;
                    }
                    let waveform = match catch_unwind(AssertUnwindSafe(|| reader.load(&job))) {
                        Ok(waveform) => waveform,
                        Err(payload) => {
                            log::error!(
                                "Ouch. Waveform loader #{worker_id} panicked: {}",
                                panic_message::panic_message(&payload)
                            );
                            reader = GrainReader::new(options);
                            GrainWaveform::silent(job.key, 1)
                        }
                    };
                    store.insert(&job.index, Arc::new(waveform));
                    store.release_unused_indices();
                }
                WaveformLoaderMessage::Shutdown => break,
            }
        }
        log::debug!("Waveform loader #{worker_id} stopped");
    }
}

impl Drop for WaveformLoaderWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(WaveformLoaderMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                log::error!(
                    "Waveform loader thread panicked: {}",
                    panic_message::panic_message(&payload)
                );
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Per worker decode state: keeps the embedded sound stream of the last used container open.
struct GrainReader {
    options: WaveformOptions,
    source: Option<(PathBuf, Range<u64>)>,
    decoder: Option<AudioDecoder>,
}

impl GrainReader {
    fn new(options: WaveformOptions) -> Self {
        Self {
            options,
            source: None,
            decoder: None,
        }
    }

    /// Load the given job's waveform. Grains that fail to load are silent.
    fn load(&mut self, job: &WaveformJob) -> GrainWaveform {
        match self.try_load(job) {
            Ok(waveform) => waveform,
            Err(err) => {
                log::warn!(
                    "Failed to load grain #{} from '{}': {err}",
                    job.key.grain,
                    job.index.path().display()
                );
                let channel_count = self
                    .decoder
                    .as_ref()
                    .map(|decoder| decoder.channel_count())
                    .unwrap_or(1);
                // the stream's position is unknown after errors
                self.source = None;
                self.decoder = None;
                GrainWaveform::silent(job.key, channel_count)
            }
        }
    }

    fn try_load(&mut self, job: &WaveformJob) -> Result<GrainWaveform, Error> {
        let index = &job.index;
        let key = job.key;
        let center = index
            .center_sample_for_grain(key.grain as usize)
            .ok_or_else(|| Error::DecodeError(format!("Invalid grain #{}", key.grain).into()))?;

        let decoder = self.open(index)?;
        let channel_count = decoder.channel_count();

        // read all source frames the resampler needs: frames outside the sound are silent
        let range = key.window.range();
        let source_frames = source_frame_range(center, range, key.speed_ratio);
        let mut source =
            vec![0.0; (source_frames.end - source_frames.start) as usize * channel_count];
        let read_start = source_frames.start.max(0);
        let read_end = source_frames.end.min(index.num_samples() as i64);
        if read_end > read_start {
            let frame_count = (read_end - read_start) as usize;
            let offset = (read_start - source_frames.start) as usize * channel_count;
            let target = &mut source[offset..offset + frame_count * channel_count];
            let frames_read = decoder.read_frames(read_start as u64, target)?;
            if frames_read < frame_count {
                return Err(Error::DecodeError(
                    format!("Short read: got {frames_read} of {frame_count} frames").into(),
                ));
            }
        }

        let mut frames = vec![0.0; range.len() * channel_count];
        resample_frames(
            &source,
            source_frames.start,
            center,
            range,
            key.speed_ratio,
            channel_count,
            &mut frames,
        );
        Ok(GrainWaveform::from_frames(
            key,
            channel_count,
            frames,
            &self.options,
        ))
    }

    /// (Re)open the embedded sound stream, when the index refers to a different stream than the
    /// currently opened one.
    fn open(&mut self, index: &GrainIndex) -> Result<&mut AudioDecoder, Error> {
        let source = (index.path().to_path_buf(), index.sound_file_bytes());
        if self.decoder.is_none() || self.source.as_ref() != Some(&source) {
            self.decoder = None;
            self.source = None;
            let decoder = AudioDecoder::from_container_range(&source.0, source.1.clone())?;
            log::debug!(
                "Opened sound stream of '{}' with {} channels",
                source.0.display(),
                decoder.channel_count()
            );
            self.source = Some(source);
            self.decoder = Some(decoder);
        }
        self.decoder
            .as_mut()
            .ok_or_else(|| Error::DecodeError("Sound stream is not open".into()))
    }
}

// -------------------------------------------------------------------------------------------------
