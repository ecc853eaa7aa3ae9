//! Grain sounds and the voices which play them.

use std::{collections::VecDeque, sync::Arc};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    cache::WaveformCache,
    index::GrainIndex,
    sequence::{GrainSequence, MidiState, Point, SequenceParams},
    utils::db_to_linear,
    waveform::{GrainWaveform, WaveformKey},
    window::{WindowParams, WindowShape},
    Error,
};

// -------------------------------------------------------------------------------------------------

/// Parameters of a [`GrainSound`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundParams {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Number of grains triggered per second (0.0 - 200.0). 0 plays a single grain only.
    pub grain_rate: f32,
    /// Grain window, relative to the index's max grain width.
    pub window: WindowParams,
    /// Grain selection.
    pub sequence: SequenceParams,
}

impl Default for SoundParams {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            grain_rate: 10.0,
            window: WindowParams::default(),
            sequence: SequenceParams::default(),
        }
    }
}

impl SoundParams {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    pub fn with_grain_rate(mut self, grain_rate: f32) -> Self {
        self.grain_rate = grain_rate;
        self
    }

    pub fn with_window(mut self, window: WindowParams) -> Self {
        self.window = window;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceParams) -> Self {
        self.sequence = sequence;
        self
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_rate == 0 {
            return Err(Error::ParameterError(
                "Output sample rate must be > 0".to_string(),
            ));
        }
        if !(0.0..=200.0).contains(&self.grain_rate) {
            return Err(Error::ParameterError(
                "Grain rate must be between 0 and 200 Hz".to_string(),
            ));
        }
        self.window.validate()?;
        self.sequence.validate()?;
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// A grain index, bound to a set of sound parameters and an output sample rate.
///
/// Sounds are immutable: parameter or index changes create a new sound. Voices which still play
/// an old sound keep its index alive until they finished.
#[derive(Debug, Clone)]
pub struct GrainSound {
    index: Arc<GrainIndex>,
    params: SoundParams,
    speed_ratio: f32,
    window: WindowShape,
}

impl GrainSound {
    pub fn new(index: Arc<GrainIndex>, params: SoundParams) -> Result<Self, Error> {
        params.validate()?;
        let speed_ratio =
            index.sample_rate() as f32 / params.sample_rate as f32 * params.sequence.speed_warp;
        let window = WindowShape::new(
            index.max_grain_width_samples() / speed_ratio,
            &params.window,
        );
        Ok(Self {
            index,
            params,
            speed_ratio,
            window,
        })
    }

    pub fn index(&self) -> &Arc<GrainIndex> {
        &self.index
    }

    pub fn params(&self) -> &SoundParams {
        &self.params
    }

    /// Grain playback speed: source samples per output sample.
    pub fn speed_ratio(&self) -> f32 {
        self.speed_ratio
    }

    /// Window shape, in output samples.
    pub fn window(&self) -> &WindowShape {
        &self.window
    }

    /// Max grain width in output samples.
    pub fn max_grain_width_samples(&self) -> f32 {
        self.index.max_grain_width_samples() / self.speed_ratio
    }

    pub fn grain_repeats_per_sample(&self) -> f64 {
        self.params.grain_rate as f64 / self.params.sample_rate as f64
    }

    /// Number of queued grains a voice needs to cover a full window of overlapping grains.
    pub fn target_queue_depth(&self) -> usize {
        (1.0 + self.window.range().len() as f64 * self.grain_repeats_per_sample()).ceil() as usize
    }

    pub fn is_using_index(&self, index: &GrainIndex) -> bool {
        self.index.id() == index.id()
    }

    pub fn waveform_key_for_grain(&self, grain: u32) -> WaveformKey {
        WaveformKey::new(grain, self.speed_ratio, self.window)
    }

    /// Create a new sequence for a played MIDI note.
    pub fn midi_sequence(&self, midi: MidiState, seed: u64) -> GrainSequence {
        GrainSequence::midi(Arc::clone(&self.index), self.params.sequence, midi, seed)
    }

    /// Create a new sequence which repeats a single grain.
    pub fn stationary_sequence(&self, grain: u32, velocity: f32) -> GrainSequence {
        let gain = db_to_linear(self.params.sequence.gain_db_for_velocity(velocity));
        GrainSequence::stationary(Point { grain, gain })
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GrainState {
    /// Waveform is not yet loaded.
    Pending,
    Ready(Arc<GrainWaveform>),
    /// Waveform was missing while playing: renders silence.
    Skipped,
}

#[derive(Debug, Clone)]
struct QueuedGrain {
    point: Point,
    state: GrainState,
}

impl QueuedGrain {
    fn new(point: Point) -> Self {
        Self {
            point,
            state: GrainState::Pending,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, GrainState::Pending)
    }

    /// Length in output frames, if known.
    fn frame_count(&self, sound: &GrainSound) -> Option<usize> {
        match &self.state {
            GrainState::Pending => None,
            GrainState::Ready(waveform) => Some(waveform.frame_count()),
            GrainState::Skipped => Some(sound.window().range().len()),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Recently played, unique grains of a voice. Used as replacements for grains which are still
/// loading.
#[derive(Debug)]
struct Reservoir {
    grains: Vec<QueuedGrain>,
    next_slot: usize,
}

impl Reservoir {
    const CAPACITY: usize = 16;

    fn new() -> Self {
        Self {
            grains: Vec::with_capacity(Self::CAPACITY),
            next_slot: 0,
        }
    }

    fn add(&mut self, grain: &QueuedGrain) {
        debug_assert!(matches!(grain.state, GrainState::Ready(_)));
        if self
            .grains
            .iter()
            .any(|item| item.point.grain == grain.point.grain)
        {
            return;
        }
        if self.grains.len() < Self::CAPACITY {
            self.grains.push(grain.clone());
        } else {
            self.grains[self.next_slot] = grain.clone();
            self.next_slot = (self.next_slot + 1) % Self::CAPACITY;
        }
    }

    fn clear(&mut self) {
        self.grains.clear();
        self.next_slot = 0;
    }
}

// -------------------------------------------------------------------------------------------------

/// Plays a [`GrainSound`] as a stream of overlapping grains.
///
/// Grains are generated by the voice's grain sequence, spaced by the sound's grain rate, and
/// fetched from the waveform cache. Rendering never waits for grains to load: grains which are
/// not ready when the voice starts delay the start, later ones get replaced by recently played
/// grains or are skipped.
pub struct GrainVoice {
    cache: Arc<WaveformCache>,
    sound: Option<Arc<GrainSound>>,
    sequence: Option<GrainSequence>,
    queue: VecDeque<QueuedGrain>,
    /// Play position, relative to the start of the first grain in the queue.
    sample_offset_in_queue: i64,
    reservoir: Reservoir,
    retry: Vec<QueuedGrain>,
    mod_wheel: u8,
    rng: SmallRng,
}

impl GrainVoice {
    const MIN_QUEUE_CAPACITY: usize = 64;

    /// Create a new voice with a randomly seeded grain sequence generator.
    pub fn new(cache: Arc<WaveformCache>) -> Self {
        Self::with_rng(cache, SmallRng::from_os_rng())
    }

    /// Create a new voice with a deterministic grain sequence generator.
    pub fn with_seed(cache: Arc<WaveformCache>, seed: u64) -> Self {
        Self::with_rng(cache, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(cache: Arc<WaveformCache>, rng: SmallRng) -> Self {
        Self {
            cache,
            sound: None,
            sequence: None,
            queue: VecDeque::with_capacity(Self::MIN_QUEUE_CAPACITY),
            sample_offset_in_queue: 0,
            reservoir: Reservoir::new(),
            retry: Vec::with_capacity(Self::MIN_QUEUE_CAPACITY),
            mod_wheel: MidiState::MOD_WHEEL_CENTER,
            rng,
        }
    }

    /// Currently or most recently playing sound, if any. Released by `stop_note(false)`.
    pub fn sound(&self) -> Option<&Arc<GrainSound>> {
        self.sound.as_ref()
    }

    /// A voice is active as long as it has grains to play.
    pub fn is_active(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Start playing the given sound with a new MIDI note.
    pub fn start_note(
        &mut self,
        sound: &Arc<GrainSound>,
        note: u8,
        velocity: f32,
        pitch_wheel: u16,
    ) {
        let midi = MidiState::new(note, velocity)
            .with_pitch_wheel(pitch_wheel)
            .with_mod_wheel(self.mod_wheel);
        let seed = self.rng.random::<u64>();
        self.sound = Some(Arc::clone(sound));
        self.sequence = Some(sound.midi_sequence(midi, seed));
        self.clear_grain_queue();
        self.reservoir.clear();
        self.reserve_queue(sound);
        if velocity > 0.0 {
            self.fill_queue(sound);
            self.fetch_queue_waveforms(sound);
        }
    }

    /// Start or continue playing a single grain of the given sound.
    pub fn start_grain(&mut self, sound: &Arc<GrainSound>, grain: u32, velocity: f32) {
        if grain as usize >= sound.index().num_grains() {
            log::warn!("Ignoring invalid grain #{grain}");
            return;
        }
        let is_same_sound = self
            .sound
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, sound));
        if !self.is_active() || !is_same_sound {
            self.sound = Some(Arc::clone(sound));
            self.clear_grain_queue();
            self.reservoir.clear();
            self.reserve_queue(sound);
        }
        self.sequence = Some(sound.stationary_sequence(grain, velocity));
        self.trim_and_refill_queue(2);
        self.replace_reservoir_with_queued_grains();
    }

    /// Stop generating new grains. With `allow_tail_off`, already playing grains play until they
    /// finished, else the voice stops immediately.
    pub fn stop_note(&mut self, allow_tail_off: bool) {
        self.sequence = None;
        if allow_tail_off {
            self.trim_queue_to_length(1);
        } else {
            self.clear_grain_queue();
            self.reservoir.clear();
            self.sound = None;
        }
    }

    pub fn pitch_wheel_moved(&mut self, value: u16) {
        if let Some(midi) = self.sequence.as_mut().and_then(|s| s.midi_state_mut()) {
            midi.pitch_wheel = value.min(16383);
            self.trim_and_refill_queue(2);
        }
    }

    /// Handle MIDI controller changes. Only the mod wheel (CC 1) is used.
    pub fn controller_moved(&mut self, controller: u8, value: u8) {
        if controller == 0x01 {
            self.mod_wheel = value.min(127);
            if let Some(midi) = self.sequence.as_mut().and_then(|s| s.midi_state_mut()) {
                midi.mod_wheel = value.min(127);
                self.trim_and_refill_queue(2);
            }
        }
    }

    /// Mix the next block of grains into the given interleaved output buffer.
    pub fn render(&mut self, output: &mut [f32], channel_count: usize) {
        debug_assert!(channel_count > 0 && output.len() % channel_count == 0);
        Self::assert_no_alloc(|| {
            let Some(sound) = self.sound.clone() else {
                return;
            };
            // render in chunks of at most one grain interval, so the queue covers each chunk
            let mut interval = 0;
            let chunk_frames =
                if next_repeat_timestamp(&mut interval, sound.grain_repeats_per_sample()) {
                    interval as usize
                } else {
                    output.len() / channel_count
                };
            for chunk in output.chunks_mut(chunk_frames.max(1) * channel_count) {
                self.fill_queue(&sound);
                self.fetch_queue_waveforms(&sound);
                if self.queue.is_empty() {
                    // no more work. keep the sound: its index must not be freed while rendering
                    self.sequence = None;
                    break;
                }
                if !self.render_from_queue(&sound, chunk, channel_count) {
                    break;
                }
            }
        })
    }

    fn clear_grain_queue(&mut self) {
        self.sample_offset_in_queue = 0;
        self.queue.clear();
    }

    fn reserve_queue(&mut self, sound: &GrainSound) {
        let capacity = (2 * sound.target_queue_depth()).max(Self::MIN_QUEUE_CAPACITY);
        self.queue.reserve(capacity.saturating_sub(self.queue.len()));
        self.retry.reserve(capacity.saturating_sub(self.retry.len()));
    }

    fn fill_queue(&mut self, sound: &GrainSound) {
        if let Some(sequence) = self.sequence.as_mut() {
            let target = sound.target_queue_depth();
            while self.queue.len() < target {
                self.queue.push_back(QueuedGrain::new(sequence.next_point()));
            }
        }
    }

    fn fetch_queue_waveforms(&mut self, sound: &GrainSound) {
        for grain in self.queue.iter_mut().filter(|grain| grain.is_pending()) {
            let key = sound.waveform_key_for_grain(grain.point.grain);
            if let Some(waveform) = self.cache.get(sound.index(), &key) {
                grain.state = GrainState::Ready(waveform);
            }
        }
    }

    /// Number of queued grains which already started playing.
    fn num_active_grains_in_queue(&self, sound: &GrainSound) -> usize {
        let repeat_rate = sound.grain_repeats_per_sample();
        let mut queue_timestamp = 0;
        let mut num_active = 0;
        for grain in &self.queue {
            if grain.is_pending() {
                // stalled, can't be active yet
                break;
            }
            if queue_timestamp > self.sample_offset_in_queue {
                break;
            }
            num_active += 1;
            if !next_repeat_timestamp(&mut queue_timestamp, repeat_rate) {
                break;
            }
        }
        num_active
    }

    fn trim_queue_to_length(&mut self, length: usize) {
        match self.sound.clone() {
            None => self.queue.clear(),
            Some(sound) => {
                if self.queue.len() > length {
                    let length = length.max(self.num_active_grains_in_queue(&sound));
                    self.queue.truncate(length);
                }
            }
        }
    }

    fn trim_and_refill_queue(&mut self, length: usize) {
        self.trim_queue_to_length(length);
        if let Some(sound) = self.sound.clone() {
            self.fill_queue(&sound);
            self.fetch_queue_waveforms(&sound);
        }
    }

    fn replace_reservoir_with_queued_grains(&mut self) {
        self.reservoir.clear();
        for grain in &self.queue {
            if matches!(grain.state, GrainState::Ready(_)) {
                self.reservoir.add(grain);
            }
        }
    }

    /// Render queued grains into the given output. Returns false when the voice is waiting for
    /// its first grain.
    fn render_from_queue(
        &mut self,
        sound: &GrainSound,
        output: &mut [f32],
        channel_count: usize,
    ) -> bool {
        let repeat_rate = sound.grain_repeats_per_sample();
        let block_frames = (output.len() / channel_count) as i64;
        let mut queue_timestamp = 0;
        self.retry.clear();

        for index in 0..self.queue.len() {
            if self.queue[index].is_pending() {
                if self.retry.len() < self.retry.capacity() {
                    self.retry.push(self.queue[index].clone());
                }
                if !self.reservoir.grains.is_empty() {
                    let replacement = self.rng.random_range(0..self.reservoir.grains.len());
                    self.queue[index] = self.reservoir.grains[replacement].clone();
                } else if queue_timestamp == 0 && self.sample_offset_in_queue == 0 {
                    // not yet playing: delay the start
                    return false;
                } else {
                    // overlaps with already playing grains: silence it
                    self.queue[index].state = GrainState::Skipped;
                }
            }
            if queue_timestamp > self.sample_offset_in_queue + block_frames {
                // starts after this block
                break;
            }

            let grain = &self.queue[index];
            if let GrainState::Ready(waveform) = &grain.state {
                let relative = queue_timestamp - self.sample_offset_in_queue;
                let copy_source = (-relative).max(0);
                let copy_dest = relative.max(0);
                let copy_size =
                    (block_frames - copy_dest).min(waveform.frame_count() as i64 - copy_source);
                if copy_size > 0 {
                    mix_frames(
                        waveform,
                        grain.point.gain,
                        copy_source as usize,
                        &mut output[copy_dest as usize * channel_count..],
                        channel_count,
                        copy_size as usize,
                    );
                }
            }
            if !next_repeat_timestamp(&mut queue_timestamp, repeat_rate) {
                break;
            }
        }

        // advance past the rendered block and remove finished grains
        self.sample_offset_in_queue += block_frames;
        while let Some(front) = self.queue.front() {
            let Some(frame_count) = front.frame_count(sound) else {
                break;
            };
            if self.sample_offset_in_queue < frame_count as i64 {
                // still playing
                break;
            }
            let mut interval = 0;
            if next_repeat_timestamp(&mut interval, repeat_rate) {
                self.sample_offset_in_queue -= interval;
                if let Some(grain) = self.queue.pop_front() {
                    if matches!(grain.state, GrainState::Ready(_)) {
                        self.reservoir.add(&grain);
                    }
                }
            } else {
                // not repeating: done
                self.queue.clear();
                self.sequence = None;
            }
        }

        // retry missing grains, but only when the loaders are keeping up
        if !self.retry.is_empty() && self.cache.average_load_queue_depth() < 1.0 {
            for grain in self.retry.drain(..) {
                if self.queue.len() >= self.queue.capacity() {
                    break;
                }
                self.queue.push_back(grain);
            }
        }
        true
    }

    fn assert_no_alloc<T, F: FnOnce() -> T>(func: F) -> T {
        #[cfg(feature = "assert-allocs")]
        return assert_no_alloc::assert_no_alloc::<T, F>(func);

        #[cfg(not(feature = "assert-allocs"))]
        return func();
    }
}

// -------------------------------------------------------------------------------------------------

/// Advance the given timestamp to the next grain repetition. Returns false when grains do not
/// repeat at the given rate.
#[inline]
fn next_repeat_timestamp(timestamp: &mut i64, repeats_per_sample: f64) -> bool {
    const MAX_INTERVAL: i64 = 1 << 22;
    if repeats_per_sample > 1.0 / MAX_INTERVAL as f64 {
        *timestamp += (1.0 / repeats_per_sample).ceil() as i64;
        true
    } else {
        false
    }
}

/// Add `frame_count` frames of the given waveform, starting at `source_frame`, to the interleaved
/// output. Waveform channels are repeated to fill all output channels.
#[inline]
fn mix_frames(
    waveform: &GrainWaveform,
    gain: f32,
    source_frame: usize,
    output: &mut [f32],
    channel_count: usize,
    frame_count: usize,
) {
    let source_channels = waveform.channel_count().max(1);
    let source = &waveform.buffer()[source_frame * source_channels..];
    for (out_frame, in_frame) in output
        .chunks_exact_mut(channel_count)
        .zip(source.chunks_exact(source_channels))
        .take(frame_count)
    {
        for (channel, sample) in out_frame.iter_mut().enumerate() {
            *sample += in_frame[channel % source_channels] * gain;
        }
    }
}

// -------------------------------------------------------------------------------------------------
