use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use dashmap::{DashMap, DashSet};

use crate::{
    error::Error,
    index::GrainIndex,
    waveform::{GrainWaveform, WaveformKey, WaveformOptions},
    worker::{WaveformJob, WaveformLoaderWorker},
};

// -------------------------------------------------------------------------------------------------

/// Waveform store key: waveform keys are unique within a single grain index only.
pub(crate) type StoreKey = (usize, WaveformKey);

/// Waveform storage, shared by the cache and its loader workers.
///
/// Waveforms of all grain indices which are still in use are kept side by side, so voices of a
/// superseded index keep playing while voices of a newly loaded one start. Waveforms of indices
/// which are no longer referenced are released by [`Self::release_unused_indices`], which is
/// called by the loader workers and thus never on the real-time thread.
#[derive(Debug, Default)]
pub(crate) struct WaveformStore {
    waveforms: DashMap<StoreKey, Arc<GrainWaveform>>,
    pending: DashSet<StoreKey>,
    indices: Mutex<Vec<(usize, Weak<GrainIndex>)>>,
}

impl WaveformStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index_id: usize, key: &WaveformKey) -> Option<Arc<GrainWaveform>> {
        self.waveforms
            .get(&(index_id, *key))
            .map(|waveform| Arc::clone(waveform.value()))
    }

    /// Mark the given key as requested. Returns false when it's already pending.
    pub fn request(&self, index_id: usize, key: WaveformKey) -> bool {
        self.pending.insert((index_id, key))
    }

    /// Forget a pending request, e.g. when it could not be dispatched.
    pub fn cancel(&self, index_id: usize, key: &WaveformKey) {
        self.pending.remove(&(index_id, *key));
    }

    /// Insert or replace a loaded waveform of the given index.
    pub fn insert(&self, index: &Arc<GrainIndex>, waveform: Arc<GrainWaveform>) {
        self.track_index(index);
        let key = (index.id(), *waveform.key());
        self.waveforms.insert(key, waveform);
        self.pending.remove(&key);
    }

    /// Remember the given index, so its waveforms get released when it's no longer used.
    pub fn track_index(&self, index: &Arc<GrainIndex>) {
        let mut indices = self.indices.lock().unwrap();
        if !indices.iter().any(|(id, _)| *id == index.id()) {
            indices.push((index.id(), Arc::downgrade(index)));
        }
    }

    /// Number of tracked indices which are still in use.
    pub fn index_count(&self) -> usize {
        let indices = self.indices.lock().unwrap();
        indices
            .iter()
            .filter(|(_, index)| index.strong_count() > 0)
            .count()
    }

    /// Drop all waveforms and pending requests of indices which are no longer referenced.
    /// Returns the number of released indices.
    pub fn release_unused_indices(&self) -> usize {
        let released = {
            let mut indices = self.indices.lock().unwrap();
            if indices.iter().all(|(_, index)| index.strong_count() > 0) {
                return 0;
            }
            let released = indices
                .iter()
                .filter(|(_, index)| index.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            indices.retain(|(_, index)| index.strong_count() > 0);
            released
        };
        self.waveforms
            .retain(|(index_id, _), _| !released.contains(index_id));
        self.pending
            .retain(|(index_id, _)| !released.contains(index_id));
        log::debug!("Released waveforms of grain indices {released:?}");
        released.len()
    }

    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&self) {
        self.pending.clear();
        self.waveforms.clear();
    }
}

// -------------------------------------------------------------------------------------------------

/// Concurrent cache of windowed grain waveforms.
///
/// Cache hits are served immediately. Misses are dispatched round-robin to a fixed pool of
/// [`WaveformLoaderWorker`]s and reported as "not ready": the waveform shows up in the cache as
/// soon as a worker loaded it. Each distinct key is requested once only, until it got loaded.
///
/// Lookups never block on decoding, so the cache can be queried from real-time threads.
pub struct WaveformCache {
    store: Arc<WaveformStore>,
    workers: Vec<WaveformLoaderWorker>,
    next_worker: AtomicUsize,
    dispatched_jobs: AtomicUsize,
}

impl WaveformCache {
    /// Create a new cache with the given number of loader workers.
    pub fn new(worker_count: usize, options: WaveformOptions) -> Result<Self, Error> {
        if worker_count == 0 {
            return Err(Error::ParameterError(
                "waveform cache needs at least one loader worker".to_string(),
            ));
        }
        options.validate()?;
        let store = Arc::new(WaveformStore::new());
        let workers = (0..worker_count)
            .map(|worker_id| WaveformLoaderWorker::new(worker_id, Arc::clone(&store), options))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Started {worker_count} waveform loader workers");
        Ok(Self {
            store,
            workers,
            next_worker: AtomicUsize::new(0),
            dispatched_jobs: AtomicUsize::new(0),
        })
    }

    /// Create a cache without workers: misses are recorded, but never loaded.
    #[cfg(test)]
    pub(crate) fn without_workers() -> Self {
        Self {
            store: Arc::new(WaveformStore::new()),
            workers: Vec::new(),
            next_worker: AtomicUsize::new(0),
            dispatched_jobs: AtomicUsize::new(0),
        }
    }

    /// Get the waveform for the given key of the given index, if it's loaded. Else request it
    /// from a loader worker and return `None`.
    ///
    /// Lookups only touch the map shards of the given key: switching to a new index never
    /// releases waveforms of the old one here. See [`Self::release_unused`].
    pub fn get(&self, index: &Arc<GrainIndex>, key: &WaveformKey) -> Option<Arc<GrainWaveform>> {
        if let Some(waveform) = self.store.get(index.id(), key) {
            return Some(waveform);
        }
        // NB: set inserts and channel sends may allocate here, which is fine
        Self::permit_alloc(|| {
            if self.store.request(index.id(), *key) && !self.workers.is_empty() {
                let worker_index =
                    self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                let job = WaveformJob {
                    index: Arc::clone(index),
                    key: *key,
                };
                match self.workers[worker_index].add_job(job) {
                    Ok(()) => {
                        self.dispatched_jobs.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        log::warn!("Failed to dispatch waveform load: {err}");
                        self.store.cancel(index.id(), key);
                    }
                }
            }
        });
        None
    }

    /// Number of loaded waveforms.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requested, but not yet loaded waveforms.
    pub fn pending_len(&self) -> usize {
        self.store.pending_len()
    }

    /// Total number of load jobs dispatched to workers.
    pub fn dispatched_job_count(&self) -> usize {
        self.dispatched_jobs.load(Ordering::Relaxed)
    }

    /// Drop all loaded waveforms and forget pending requests.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Release waveforms of grain indices which are no longer used by any sound or loader.
    /// Loader workers do this after each job: call it on index changes to release memory earlier.
    /// Must not be called from real-time threads. Returns the number of released indices.
    pub fn release_unused(&self) -> usize {
        self.store.release_unused_indices()
    }

    /// Number of grain indices with waveforms in the cache, which are still in use.
    pub fn index_count(&self) -> usize {
        self.store.index_count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Average number of queued jobs per worker.
    pub fn average_load_queue_depth(&self) -> f32 {
        if self.workers.is_empty() {
            return 0.0;
        }
        let total = self
            .workers
            .iter()
            .map(|worker| worker.queue_len())
            .sum::<usize>();
        total as f32 / self.workers.len() as f32
    }

    /// Insert a waveform for the given index directly.
    #[cfg(test)]
    pub(crate) fn insert_waveform(&self, index: &Arc<GrainIndex>, waveform: GrainWaveform) {
        self.store.insert(index, Arc::new(waveform));
    }

    fn permit_alloc<T, F: FnOnce() -> T>(func: F) -> T {
        #[cfg(feature = "assert-allocs")]
        return assert_no_alloc::permit_alloc(func);

        #[cfg(not(feature = "assert-allocs"))]
        return func();
    }
}

// -------------------------------------------------------------------------------------------------
