#![doc = include_str!("../README.md")]

// private mods (will be partly re-exported)
mod cache;
mod container;
mod data;
mod decoder;
mod error;
mod index;
mod loader;
mod sequence;
mod voice;
mod waveform;
mod window;
mod worker;

#[cfg(test)]
mod testutil;

// public, flat re-exports
pub use error::Error;

pub use cache::WaveformCache;
pub use container::{Container, ContainerEntry, ContainerRangeReader};
pub use data::{GrainData, GrainDataOptions};
pub use decoder::AudioDecoder;
pub use index::{GrainIndex, GRAINS_ENTRY_NAME, INDEX_ENTRY_NAME, SOUND_ENTRY_NAME};
pub use loader::{
    IndexLoader, IndexLoaderState, IndexLoaderStatusEvent, LoadOutcome, LOADING_STATUS,
};
pub use sequence::{GrainSequence, MidiGrainSequence, MidiState, Point, SequenceParams};
pub use voice::{GrainSound, GrainVoice, SoundParams};
pub use waveform::{GrainWaveform, WaveformKey, WaveformOptions};
pub use window::{WindowParams, WindowRange, WindowShape};
pub use worker::{WaveformJob, WaveformLoaderMessage, WaveformLoaderWorker};

// public mods
pub mod utils;
