use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{error::Error, index::GrainIndex};

// -------------------------------------------------------------------------------------------------

/// Status text, which is shown while an index is loading.
pub const LOADING_STATUS: &str = "Loading grain index...";

// -------------------------------------------------------------------------------------------------

/// Result of the last finished index load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LoadOutcome {
    Ok,
    Failed,
}

/// State of an [`IndexLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum IndexLoaderState {
    /// Nothing got loaded yet.
    Idle,
    /// A load job got scheduled, but did not start yet.
    LoadPending,
    /// A load job is running.
    Loading,
    /// The last load job finished.
    Loaded(LoadOutcome),
}

/// Status changes of an [`IndexLoader`], sent to an optional observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLoaderStatusEvent {
    pub state: IndexLoaderState,
    pub status: String,
}

// -------------------------------------------------------------------------------------------------

/// Messages sent to the index loader thread.
#[derive(Debug, Clone, Copy)]
enum IndexLoaderMessage {
    Load,
    Shutdown,
}

/// Input and status values, guarded by a single mutex.
#[derive(Debug)]
struct IndexLoaderValues {
    source_path: PathBuf,
    last_attempted_path: Option<PathBuf>,
    last_outcome: Option<LoadOutcome>,
    state: IndexLoaderState,
    status: String,
}

/// State shared between the loader and its thread.
struct IndexLoaderShared {
    values: Mutex<IndexLoaderValues>,
    /// Published index. Guarded independently from the values, so readers never wait for
    /// input or status changes.
    index: Mutex<Option<Arc<GrainIndex>>>,
    status_sender: Option<Sender<IndexLoaderStatusEvent>>,
}

impl IndexLoaderShared {
    fn notify(&self, state: IndexLoaderState, status: &str) {
        if let Some(sender) = &self.status_sender {
            let event = IndexLoaderStatusEvent {
                state,
                status: status.to_string(),
            };
            if let Err(err) = sender.try_send(event) {
                log::warn!("Failed to send index loader status: {err}");
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Loads grain indices in a background thread, whenever the source path changes.
///
/// The loader publishes a human readable status text and the most recently loaded index. Loads
/// which fail publish the failure reason as status, but keep the previously loaded index.
///
/// Path changes while a load is pending or running are coalesced: when a load finishes, the
/// loader checks if the source path changed meanwhile and then loads again, so the published
/// index always ends up matching the latest source path.
pub struct IndexLoader {
    shared: Arc<IndexLoaderShared>,
    sender: Sender<IndexLoaderMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IndexLoader {
    /// Create a new idle loader.
    pub fn new() -> Result<Self, Error> {
        Self::spawn(None)
    }

    /// Create a new idle loader which sends status changes to the given channel.
    pub fn with_status_sender(sender: Sender<IndexLoaderStatusEvent>) -> Result<Self, Error> {
        Self::spawn(Some(sender))
    }

    fn spawn(status_sender: Option<Sender<IndexLoaderStatusEvent>>) -> Result<Self, Error> {
        let shared = Arc::new(IndexLoaderShared {
            values: Mutex::new(IndexLoaderValues {
                source_path: PathBuf::new(),
                last_attempted_path: None,
                last_outcome: None,
                state: IndexLoaderState::Idle,
                status: String::new(),
            }),
            index: Mutex::new(None),
            status_sender,
        });
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("grainstream-index-loader".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || Self::run(shared, receiver)
            })?;
        Ok(Self {
            shared,
            sender,
            thread: Some(thread),
        })
    }

    /// Current source path. Empty, when no path got set yet.
    pub fn source_path(&self) -> PathBuf {
        self.shared.values.lock().unwrap().source_path.clone()
    }

    /// Set a new source path, scheduling a load when it changed. Empty paths are ignored.
    pub fn set_source_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let mut values = self.shared.values.lock().unwrap();
        if values.source_path == path {
            return Ok(());
        }
        values.source_path = path.to_path_buf();
        match values.state {
            IndexLoaderState::LoadPending | IndexLoaderState::Loading => {
                // the pending or running job picks up the new path
                Ok(())
            }
            IndexLoaderState::Idle | IndexLoaderState::Loaded(_) => {
                values.state = IndexLoaderState::LoadPending;
                values.status = LOADING_STATUS.to_string();
                self.shared.notify(values.state, &values.status);
                self.sender.try_send(IndexLoaderMessage::Load)?;
                Ok(())
            }
        }
    }

    /// Current status text: the index description after successful loads, the failure
    /// reason after failed ones.
    pub fn status(&self) -> String {
        self.shared.values.lock().unwrap().status.clone()
    }

    pub fn state(&self) -> IndexLoaderState {
        self.shared.values.lock().unwrap().state
    }

    /// True while a load job is pending or running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            IndexLoaderState::LoadPending | IndexLoaderState::Loading
        )
    }

    /// The most recently loaded index, if any.
    pub fn index(&self) -> Option<Arc<GrainIndex>> {
        self.shared.index.lock().unwrap().clone()
    }

    fn run(shared: Arc<IndexLoaderShared>, receiver: Receiver<IndexLoaderMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                IndexLoaderMessage::Load => Self::process_load_job(&shared),
                IndexLoaderMessage::Shutdown => break,
            }
        }
    }

    /// Load the current source path until the loaded path matches the source path.
    fn process_load_job(shared: &IndexLoaderShared) {
        loop {
            // snapshot the input
            let path = {
                let mut values = shared.values.lock().unwrap();
                if values.last_attempted_path.as_ref() == Some(&values.source_path) {
                    values.state = match values.last_outcome {
                        Some(outcome) => IndexLoaderState::Loaded(outcome),
                        None => IndexLoaderState::Idle,
                    };
                    shared.notify(values.state, &values.status);
                    break;
                }
                values.last_attempted_path = Some(values.source_path.clone());
                values.state = IndexLoaderState::Loading;
                values.status = LOADING_STATUS.to_string();
                shared.notify(values.state, &values.status);
                values.source_path.clone()
            };

            log::info!("Loading grain index '{}'...", path.display());
            let result = GrainIndex::load(&path);

            let mut values = shared.values.lock().unwrap();
            if values.source_path != path {
                log::debug!("Grain index load of '{}' got superseded", path.display());
                values.last_attempted_path = None;
                continue;
            }
            match result {
                Ok(index) => {
                    log::info!("Loaded grain index '{}': {index}", path.display());
                    values.status = index.to_string();
                    values.last_outcome = Some(LoadOutcome::Ok);
                    *shared.index.lock().unwrap() = Some(Arc::new(index));
                }
                Err(err) => {
                    log::warn!("Failed to load grain index '{}': {err}", path.display());
                    values.status = err.to_string();
                    values.last_outcome = Some(LoadOutcome::Failed);
                }
            }
        }
    }
}

impl Drop for IndexLoader {
    fn drop(&mut self) {
        let _ = self.sender.send(IndexLoaderMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                log::error!(
                    "Index loader thread panicked: {}",
                    panic_message::panic_message(&payload)
                );
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
