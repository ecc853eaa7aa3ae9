use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_channel::Sender;

use crate::{
    cache::WaveformCache,
    error::Error,
    index::GrainIndex,
    loader::{IndexLoader, IndexLoaderState, IndexLoaderStatusEvent},
    voice::{GrainSound, SoundParams},
    waveform::{GrainWaveform, WaveformKey, WaveformOptions},
};

// -------------------------------------------------------------------------------------------------

/// Options to configure [`GrainData`].
#[derive(Debug, Clone, Copy)]
pub struct GrainDataOptions {
    /// By default the number of CPUs. Number of waveform loader threads.
    pub worker_count: usize,
    /// How loaded grain waveforms get built.
    pub waveform: WaveformOptions,
}

impl Default for GrainDataOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            waveform: WaveformOptions::default(),
        }
    }
}

impl GrainDataOptions {
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn waveform(mut self, waveform: WaveformOptions) -> Self {
        self.waveform = waveform;
        self
    }

    /// Validate all parameters. Returns Error::ParameterError on errors.
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count == 0 {
            return Err(Error::ParameterError(
                "grain data options 'worker_count' value must be > 0".to_string(),
            ));
        }
        self.waveform.validate()
    }
}

// -------------------------------------------------------------------------------------------------

/// Shared grain data of a synth: the asynchronously loaded grain index and the cache of grain
/// waveforms its voices are playing.
pub struct GrainData {
    loader: IndexLoader,
    cache: Arc<WaveformCache>,
}

impl GrainData {
    pub fn new(options: GrainDataOptions) -> Result<Self, Error> {
        options.validate()?;
        let loader = IndexLoader::new()?;
        Self::with_loader(loader, options)
    }

    /// Create new grain data which sends index loader status events to the given channel.
    pub fn with_status_sender(
        options: GrainDataOptions,
        status_sender: Sender<IndexLoaderStatusEvent>,
    ) -> Result<Self, Error> {
        options.validate()?;
        let loader = IndexLoader::with_status_sender(status_sender)?;
        Self::with_loader(loader, options)
    }

    fn with_loader(loader: IndexLoader, options: GrainDataOptions) -> Result<Self, Error> {
        let cache = Arc::new(WaveformCache::new(options.worker_count, options.waveform)?);
        Ok(Self { loader, cache })
    }

    pub fn source_path(&self) -> PathBuf {
        self.loader.source_path()
    }

    /// Load the grain index from the given container path in the background.
    pub fn set_source_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.loader.set_source_path(path)
    }

    /// Current human readable load status.
    pub fn status(&self) -> String {
        self.loader.status()
    }

    pub fn state(&self) -> IndexLoaderState {
        self.loader.state()
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_busy()
    }

    /// Most recently loaded grain index, if any.
    pub fn index(&self) -> Option<Arc<GrainIndex>> {
        self.loader.index()
    }

    /// Create a sound for the most recently loaded index. Returns `Ok(None)` when no index is
    /// loaded yet.
    pub fn sound(&self, params: SoundParams) -> Result<Option<Arc<GrainSound>>, Error> {
        match self.index() {
            Some(index) => Ok(Some(Arc::new(GrainSound::new(index, params)?))),
            None => Ok(None),
        }
    }

    pub fn waveform_cache(&self) -> &Arc<WaveformCache> {
        &self.cache
    }

    /// Get a cached waveform or request it. See [`WaveformCache::get`].
    pub fn waveform(
        &self,
        index: &Arc<GrainIndex>,
        key: &WaveformKey,
    ) -> Option<Arc<GrainWaveform>> {
        self.cache.get(index, key)
    }

    pub fn average_load_queue_depth(&self) -> f32 {
        self.cache.average_load_queue_depth()
    }
}

// -------------------------------------------------------------------------------------------------
