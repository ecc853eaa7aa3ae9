//! Grain selection sequences for playing voices.

use std::sync::Arc;

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    index::GrainIndex,
    utils::{db_to_linear, note_to_hz},
    Error,
};

// -------------------------------------------------------------------------------------------------

/// A single grain selection of a [`GrainSequence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Grain number in the index.
    pub grain: u32,
    /// Linear gain factor.
    pub gain: f32,
}

// -------------------------------------------------------------------------------------------------

/// Parameters controlling how MIDI driven sequences select grains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceParams {
    /// Position of the selected grain within the pitch bin (0.0 - 1.0).
    pub sel_center: f32,
    /// Amount of mod wheel modulation applied to the grain selection (0.0 - 1.0).
    pub sel_mod: f32,
    /// Random variation of the grain selection (0.0 - 1.0).
    pub sel_spread: f32,
    /// Random pitch variation in semitones (0.0 - 8.0).
    pub pitch_spread: f32,
    /// Pitch wheel range in semitones (1.0 - 64.0).
    pub pitch_bend_range: f32,
    /// Playback speed factor of grains (0.1 - 2.0). Grains get picked from bins with pitches
    /// that compensate the speed change.
    pub speed_warp: f32,
    /// Gain in dB at velocity 0 (-100.0 - 0.0).
    pub gain_db_low: f32,
    /// Gain in dB at velocity 1 (-100.0 - 0.0).
    pub gain_db_high: f32,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            sel_center: 0.5,
            sel_mod: 1.0,
            sel_spread: 0.0,
            pitch_spread: 0.0,
            pitch_bend_range: 12.0,
            speed_warp: 1.0,
            gain_db_low: -70.0,
            gain_db_high: -30.0,
        }
    }
}

impl SequenceParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gain in dB for the given velocity.
    pub fn gain_db_for_velocity(&self, velocity: f32) -> f32 {
        let velocity = velocity.clamp(0.0, 1.0);
        self.gain_db_low + (self.gain_db_high - self.gain_db_low) * velocity
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.sel_center) {
            return Err(Error::ParameterError(
                "Selection center must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sel_mod) {
            return Err(Error::ParameterError(
                "Selection modulation must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sel_spread) {
            return Err(Error::ParameterError(
                "Selection spread must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=8.0).contains(&self.pitch_spread) {
            return Err(Error::ParameterError(
                "Pitch spread must be between 0 and 8 semitones".to_string(),
            ));
        }
        if !(1.0..=64.0).contains(&self.pitch_bend_range) {
            return Err(Error::ParameterError(
                "Pitch bend range must be between 1 and 64 semitones".to_string(),
            ));
        }
        if !(0.1..=2.0).contains(&self.speed_warp) {
            return Err(Error::ParameterError(
                "Speed warp must be between 0.1 and 2.0".to_string(),
            ));
        }
        if !(-100.0..=0.0).contains(&self.gain_db_low)
            || !(-100.0..=0.0).contains(&self.gain_db_high)
        {
            return Err(Error::ParameterError(
                "Gain must be between -100 and 0 dB".to_string(),
            ));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Live MIDI controller state of a playing note.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiState {
    /// MIDI note number (0 - 127).
    pub note: u8,
    /// Pitch wheel position (0 - 16383, centered at 8192).
    pub pitch_wheel: u16,
    /// Mod wheel position (0 - 127).
    pub mod_wheel: u8,
    /// Note velocity (0.0 - 1.0).
    pub velocity: f32,
}

impl MidiState {
    pub const PITCH_WHEEL_CENTER: u16 = 8192;
    pub const MOD_WHEEL_CENTER: u8 = 64;

    /// State for a new note with centered wheels.
    pub fn new(note: u8, velocity: f32) -> Self {
        Self {
            note: note.min(127),
            pitch_wheel: Self::PITCH_WHEEL_CENTER,
            mod_wheel: Self::MOD_WHEEL_CENTER,
            velocity: velocity.clamp(0.0, 1.0),
        }
    }

    pub fn with_pitch_wheel(mut self, pitch_wheel: u16) -> Self {
        self.pitch_wheel = pitch_wheel.min(16383);
        self
    }

    pub fn with_mod_wheel(mut self, mod_wheel: u8) -> Self {
        self.mod_wheel = mod_wheel.min(127);
        self
    }

    /// Pitch bend in range [-1, 1).
    pub fn pitch_bend(&self) -> f32 {
        self.pitch_wheel as f32 / 8192.0 - 1.0
    }

    /// Mod wheel modulation in range [-0.5, 0.5).
    pub fn modulation(&self) -> f32 {
        self.mod_wheel as f32 / 128.0 - 0.5
    }
}

// -------------------------------------------------------------------------------------------------

/// Grain sequence driven by a MIDI note and its live controller state.
#[derive(Debug, Clone)]
pub struct MidiGrainSequence {
    index: Arc<GrainIndex>,
    params: SequenceParams,
    midi: MidiState,
    rng: SmallRng,
}

impl MidiGrainSequence {
    pub fn new(index: Arc<GrainIndex>, params: SequenceParams, midi: MidiState, seed: u64) -> Self {
        let rng = SmallRng::seed_from_u64(seed);
        Self {
            index,
            params,
            midi,
            rng,
        }
    }

    pub fn index(&self) -> &Arc<GrainIndex> {
        &self.index
    }

    pub fn params(&self) -> &SequenceParams {
        &self.params
    }

    pub fn midi(&self) -> &MidiState {
        &self.midi
    }

    pub fn midi_mut(&mut self) -> &mut MidiState {
        &mut self.midi
    }

    /// Generate the next point. Always consumes two random values.
    pub fn generate(&mut self) -> Point {
        let sel_noise = self.params.sel_spread * self.rng.random_range(-1.0f32..=1.0);
        let pitch_noise = self.params.pitch_spread * self.rng.random_range(-1.0f32..=1.0);

        let sel = self.params.sel_center + self.midi.modulation() * self.params.sel_mod + sel_noise;
        let sel = sel.rem_euclid(1.0).clamp(0.0, 1.0);

        let semitones = self.midi.note as f32
            + self.params.pitch_bend_range * self.midi.pitch_bend()
            + pitch_noise;
        let hz = note_to_hz(semitones);

        let bin = self
            .index
            .closest_bin_for_pitch(hz / self.params.speed_warp);
        let grains = self.index.grains_for_bin(bin);
        let grain = if grains.is_empty() {
            grains.start
        } else {
            grains.start + (sel * (grains.len() - 1) as f32).round() as usize
        };
        let grain = grain.min(self.index.num_grains() - 1) as u32;

        let gain = db_to_linear(self.params.gain_db_for_velocity(self.midi.velocity));
        Point { grain, gain }
    }
}

// -------------------------------------------------------------------------------------------------

/// Infinite sequence of grain selections for a single playing voice.
///
/// Sequences are restarted by creating a new one only. Midi sequences are deterministic: the same
/// seed and the same calls produce the same points.
#[derive(Debug, Clone)]
pub enum GrainSequence {
    /// Grains picked from the bin closest to the note's pitch.
    Midi(MidiGrainSequence),
    /// A single grain, repeated forever.
    Stationary(Point),
}

impl GrainSequence {
    pub fn midi(index: Arc<GrainIndex>, params: SequenceParams, midi: MidiState, seed: u64) -> Self {
        Self::Midi(MidiGrainSequence::new(index, params, midi, seed))
    }

    pub fn stationary(point: Point) -> Self {
        Self::Stationary(point)
    }

    /// Generate the next point.
    pub fn next_point(&mut self) -> Point {
        match self {
            GrainSequence::Midi(sequence) => sequence.generate(),
            GrainSequence::Stationary(point) => *point,
        }
    }

    /// Mutable access to the MIDI state of MIDI driven sequences.
    pub fn midi_state_mut(&mut self) -> Option<&mut MidiState> {
        match self {
            GrainSequence::Midi(sequence) => Some(sequence.midi_mut()),
            GrainSequence::Stationary(_) => None,
        }
    }
}

impl Iterator for GrainSequence {
    type Item = Point;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_point())
    }
}

// -------------------------------------------------------------------------------------------------
