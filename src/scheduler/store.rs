//! Durable snapshot collections for jobs and runs.
//!
//! Each [`Collection`] is owned by a single writer task. Callers never
//! read-modify-write a snapshot themselves: they send a closure that the
//! writer applies to the latest state, persists, and then publishes as a
//! new revision on a [`watch`] channel. Two interleaved updates therefore
//! cannot lose each other's writes.

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::scheduler::run::Run;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// On-disk schema version of a collection file.
const STORE_VERSION: u8 = 1;

/// File name of the jobs collection inside the data directory.
pub const JOBS_FILE: &str = "jobs.json";

/// File name of the runs collection inside the data directory.
pub const RUNS_FILE: &str = "runs.json";

/// Persistence backend for a whole-snapshot collection.
pub trait SnapshotBackend<T>: Send + Sync + 'static {
    /// Load the full snapshot. A missing store is an empty snapshot.
    fn load(&self) -> Result<Vec<T>>;

    /// Replace the persisted snapshot.
    fn save(&self, items: &[T]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct StoredCollection<T> {
    #[serde(default)]
    version: u8,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Serialize)]
struct StoredCollectionRef<'a, T> {
    version: u8,
    items: &'a [T],
}

/// JSON file backend with atomic replace (write temp file, then rename).
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> SnapshotBackend<T> for JsonFileBackend
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn load(&self) -> Result<Vec<T>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SchedulerError::Store(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let stored: StoredCollection<T> = serde_json::from_slice(&bytes).map_err(|e| {
            SchedulerError::Store(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        if stored.version > STORE_VERSION {
            return Err(SchedulerError::Store(format!(
                "{} has schema version {}, newer than supported {STORE_VERSION}",
                self.path.display(),
                stored.version
            )));
        }
        Ok(stored.items)
    }

    fn save(&self, items: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::Store(format!("cannot create store directory: {e}"))
            })?;
        }

        let json = serde_json::to_vec_pretty(&StoredCollectionRef {
            version: STORE_VERSION,
            items,
        })
        .map_err(|e| SchedulerError::Store(format!("cannot serialize collection: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| SchedulerError::Store(format!("cannot write store temp file: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| SchedulerError::Store(format!("cannot finalize store file: {e}")))?;
        Ok(())
    }
}

/// Non-persistent backend; the snapshot lives only in the writer task.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl<T: Send + Sync + 'static> SnapshotBackend<T> for MemoryBackend {
    fn load(&self) -> Result<Vec<T>> {
        Ok(Vec::new())
    }

    fn save(&self, _items: &[T]) -> Result<()> {
        Ok(())
    }
}

type Reader<T> = Box<dyn FnOnce(&[T]) + Send>;
type Mutation<T> = Box<dyn FnOnce(&mut Vec<T>) + Send>;

enum Command<T> {
    Read(Reader<T>),
    Mutate {
        apply: Mutation<T>,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a single-writer snapshot collection. Cheap to clone.
pub struct Collection<T> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command<T>>,
    revision: watch::Receiver<u64>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            revision: self.revision.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("revision", &*self.revision.borrow())
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Load the snapshot from `backend` and start the writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(name: &str, backend: impl SnapshotBackend<T>) -> Result<Self> {
        let items = backend.load()?;
        debug!(collection = name, items = items.len(), "loaded collection");
        Ok(Self::spawn(name, items, Box::new(backend)))
    }

    /// In-memory collection starting empty.
    #[must_use]
    pub fn in_memory(name: &str) -> Self {
        Self::in_memory_with(name, Vec::new())
    }

    /// In-memory collection seeded with `items`.
    #[must_use]
    pub fn in_memory_with(name: &str, items: Vec<T>) -> Self {
        Self::spawn(name, items, Box::new(MemoryBackend))
    }

    fn spawn(name: &str, items: Vec<T>, backend: Box<dyn SnapshotBackend<T>>) -> Self {
        let name: Arc<str> = Arc::from(name);
        let (tx, rx) = mpsc::unbounded_channel();
        let (revision_tx, revision) = watch::channel(0);
        tokio::spawn(run_writer(Arc::clone(&name), items, backend, rx, revision_tx));
        Self { name, tx, revision }
    }

    /// Collection name (used in logs).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full snapshot copy.
    pub async fn get(&self) -> Result<Vec<T>> {
        self.read(<[T]>::to_vec).await
    }

    /// Run `f` against the current snapshot inside the writer task.
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&[T]) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (out_tx, out_rx) = oneshot::channel();
        let reader: Reader<T> = Box::new(move |items| {
            let _ = out_tx.send(f(items));
        });
        self.tx
            .send(Command::Read(reader))
            .map_err(|_| self.closed())?;
        out_rx.await.map_err(|_| self.closed())
    }

    /// Replace the whole snapshot.
    pub async fn set(&self, items: Vec<T>) -> Result<()> {
        self.update(move |current| *current = items).await
    }

    /// Apply `f` to the latest snapshot and persist the result.
    ///
    /// Unchanged snapshots are not written. When persisting fails the
    /// in-memory snapshot is rolled back and the error returned.
    pub async fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (out_tx, out_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let apply: Mutation<T> = Box::new(move |items| {
            let _ = out_tx.send(f(items));
        });
        self.tx
            .send(Command::Mutate {
                apply,
                done: done_tx,
            })
            .map_err(|_| self.closed())?;
        done_rx.await.map_err(|_| self.closed())??;
        out_rx.await.map_err(|_| self.closed())
    }

    /// Receiver notified with a new revision after every committed change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    /// Number of committed changes since the collection was opened.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn closed(&self) -> SchedulerError {
        SchedulerError::Store(format!("{} store writer has stopped", self.name))
    }
}

async fn run_writer<T>(
    name: Arc<str>,
    mut items: Vec<T>,
    backend: Box<dyn SnapshotBackend<T>>,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    revision_tx: watch::Sender<u64>,
) where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let mut revision = 0_u64;
    while let Some(command) = rx.recv().await {
        match command {
            Command::Read(reader) => reader(&items),
            Command::Mutate { apply, done } => {
                let before = items.clone();
                apply(&mut items);
                if items == before {
                    let _ = done.send(Ok(()));
                    continue;
                }
                match backend.save(&items) {
                    Ok(()) => {
                        revision += 1;
                        revision_tx.send_replace(revision);
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        warn!(collection = %name, error = %e, "persist failed, rolling back");
                        items = before;
                        let _ = done.send(Err(e));
                    }
                }
            }
        }
    }
    debug!(collection = %name, "store writer stopped");
}

/// The two durable collections.
#[derive(Debug, Clone)]
pub struct Stores {
    pub jobs: Collection<Job>,
    pub runs: Collection<Run>,
}

impl Stores {
    /// Open `jobs.json` and `runs.json` under `dir`.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            jobs: Collection::open("jobs", JsonFileBackend::new(dir.join(JOBS_FILE)))?,
            runs: Collection::open("runs", JsonFileBackend::new(dir.join(RUNS_FILE)))?,
        })
    }

    /// Empty, non-persistent stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            jobs: Collection::in_memory("jobs"),
            runs: Collection::in_memory("runs"),
        }
    }
}
