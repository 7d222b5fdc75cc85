//! Store lifecycle
//!
//! [`DataStack::open`] resolves the current model, migrates the store on
//! disk if needed and opens it. The open store then lives on a dedicated
//! worker thread; everything that reads or writes it is sent there as a job
//! through [`DataStack::perform`], and jobs run one at a time in the order
//! they were submitted.
//!
//! ```ignore
//! let stack = DataStack::open(StackOptions::from_config(&config, "Notes"))?;
//!
//! let count = stack
//!     .perform(|store| Ok(store.count("Note", None)?))
//!     .await?;
//! ```
//!
//! `DataStack` is cheap to clone. The worker exits, and the store file is
//! released, when the last clone is dropped.

use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identifier::ObjectLocation;
use crate::migration::{MigrationReport, Migrator};
use crate::model::SchemaModel;
use crate::registry::{DirectoryBundle, ModelRegistry, ResourceBundle};
use crate::storage::engine::locate;
use crate::storage::files::ensure_parent;
use crate::storage::{SqliteStore, StorageError, StorageResult, StoreFiles};

/// Where the store lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A file under the data directory, migrated on open
    Persistent,
    /// An empty in-memory store, discarded when the stack is dropped
    Memory,
}

/// Everything needed to open a stack
#[derive(Clone)]
pub struct StackOptions {
    pub mode: Mode,
    pub model_name: String,
    pub bundle: Arc<dyn ResourceBundle>,
    /// Use this model as the current version instead of the bundled one
    pub model: Option<SchemaModel>,
    pub data_dir: PathBuf,
}

impl StackOptions {
    pub fn new(
        model_name: impl Into<String>,
        bundle: Arc<dyn ResourceBundle>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mode: Mode::Persistent,
            model_name: model_name.into(),
            bundle,
            model: None,
            data_dir: data_dir.into(),
        }
    }

    /// Options for `model_name` using the directories in `config`
    ///
    /// Without a configured bundle directory, resources are looked up in
    /// the working directory.
    pub fn from_config(config: &Config, model_name: impl Into<String>) -> Self {
        let bundle_dir = config
            .bundle_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(
            model_name,
            Arc::new(DirectoryBundle::new(bundle_dir)),
            config.data_dir.clone(),
        )
    }

    pub fn in_memory(mut self) -> Self {
        self.mode = Mode::Memory;
        self
    }

    pub fn with_model(mut self, model: SchemaModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Path of the store file in persistent mode
    pub fn store_path(&self) -> PathBuf {
        StoreFiles::for_model(&self.data_dir, &self.model_name)
            .path()
            .to_path_buf()
    }
}

type Job = Box<dyn FnOnce(&mut SqliteStore) + Send>;

/// Handle to an open store and its worker
#[derive(Clone)]
pub struct DataStack {
    inner: Arc<StackInner>,
}

struct StackInner {
    sender: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    store_id: Uuid,
    model: Arc<SchemaModel>,
    mode: Mode,
    path: Option<PathBuf>,
    report: MigrationReport,
}

impl DataStack {
    /// Open the store described by `options`, migrating it first if needed
    ///
    /// Blocks while a migration runs. Every failure comes back as an
    /// [`Error`]; nothing here terminates the process.
    pub fn open(options: StackOptions) -> Result<Self> {
        let registry = ModelRegistry::new(options.bundle.clone());
        let current = match &options.model {
            Some(model) => model.clone(),
            None => registry.load(&options.model_name)?,
        };

        match options.mode {
            Mode::Memory => {
                let model = Arc::new(current);
                let store = SqliteStore::open_in_memory(model.clone()).map_err(|source| {
                    Error::StoreOpenFailed {
                        path: PathBuf::from(":memory:"),
                        source,
                    }
                })?;
                let report = MigrationReport {
                    source_version: None,
                    destination_version: model.version(),
                    steps: Vec::new(),
                };
                Self::start(store, None, Mode::Memory, report)
            }
            Mode::Persistent => {
                let path = options.store_path();
                let open_failed = |source: StorageError| Error::StoreOpenFailed {
                    path: path.clone(),
                    source,
                };
                let lease = StoreLease::acquire(&path).map_err(open_failed)?;

                let mut versions = registry.load_all_versions(&options.model_name)?;
                if versions.is_empty() {
                    versions.push(current.clone());
                }
                let report = Migrator::new(registry, options.model_name.as_str())
                    .migrate(&path, &versions, &current)?;

                let store = SqliteStore::open(&path, Arc::new(current)).map_err(open_failed)?;
                Self::start(store, Some(lease), Mode::Persistent, report)
            }
        }
    }

    fn start(
        store: SqliteStore,
        lease: Option<StoreLease>,
        mode: Mode,
        report: MigrationReport,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let store_id = store.store_id();
        let model = Arc::new(store.model().clone());
        let path = store.path().map(Path::to_path_buf);

        let worker = thread::Builder::new()
            .name(format!("schemastack-{}", model.name()))
            .spawn(move || run_worker(store, lease, receiver))
            .map_err(|e| Error::StoreOpenFailed {
                path: path.clone().unwrap_or_default(),
                source: StorageError::Io {
                    path: path.clone().unwrap_or_default(),
                    source: e,
                },
            })?;

        info!(
            "Opened store {} with model '{}' (version {})",
            store_id,
            model.name(),
            model.version()
        );

        Ok(Self {
            inner: Arc::new(StackInner {
                sender: Some(sender),
                worker_id: worker.thread().id(),
                worker: Some(worker),
                store_id,
                model,
                mode,
                path,
                report,
            }),
        })
    }

    /// Run `work` against the store on the worker thread
    ///
    /// The job is queued immediately, before the returned future is polled.
    /// Dropping the future does not cancel it.
    pub fn perform<T, F>(&self, work: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce(&mut SqliteStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let queued = self.submit(Box::new(move |store: &mut SqliteStore| {
            let _ = reply.send(work(store));
        }));

        async move {
            if !queued {
                return Err(Error::ContextClosed);
            }
            receiver.await.map_err(|_| Error::ContextClosed)?
        }
    }

    /// Queue `work` without waiting for it; failures are logged
    pub fn perform_background<F>(&self, work: F)
    where
        F: FnOnce(&mut SqliteStore) -> Result<()> + Send + 'static,
    {
        let queued = self.submit(Box::new(move |store: &mut SqliteStore| {
            if let Err(e) = work(store) {
                warn!("Background store job failed: {}", e);
            }
        }));
        if !queued {
            warn!("Store context is closed, background job dropped");
        }
    }

    fn submit(&self, job: Job) -> bool {
        match &self.inner.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Map an identifier string to a location in this store
    ///
    /// `None` if the string is malformed, belongs to another store or names
    /// a record that does not exist.
    pub fn resolve_location(
        &self,
        identifier: &str,
    ) -> impl Future<Output = Result<Option<ObjectLocation>>> + Send + 'static {
        let lookup = self.parse_location(identifier).map(|location| {
            self.perform(move |store| Ok(store.fetch(&location)?.map(|_| location)))
        });

        async move {
            match lookup {
                Some(lookup) => lookup.await,
                None => Ok(None),
            }
        }
    }

    /// Parse an identifier minted by this store without checking the record exists
    pub fn parse_location(&self, identifier: &str) -> Option<ObjectLocation> {
        locate(identifier, self.inner.store_id, &self.inner.model)
    }

    pub fn store_id(&self) -> Uuid {
        self.inner.store_id
    }

    pub fn model(&self) -> &SchemaModel {
        &self.inner.model
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Path of the store file; `None` in memory mode
    pub fn store_path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// What happened to the store while it was being opened
    pub fn migration_report(&self) -> &MigrationReport {
        &self.inner.report
    }
}

impl Drop for StackInner {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once queued jobs finish
        self.sender.take();

        if let Some(worker) = self.worker.take() {
            if thread::current().id() == self.worker_id {
                return;
            }
            if worker.join().is_err() {
                error!("Store worker for {} panicked", self.store_id);
            }
        }
    }
}

fn run_worker(
    mut store: SqliteStore,
    lease: Option<StoreLease>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = receiver.blocking_recv() {
        if catch_unwind(AssertUnwindSafe(|| job(&mut store))).is_err() {
            error!("Store job panicked");
        }
    }

    debug!("Closing store {}", store.store_id());
    drop(store);
    drop(lease);
}

/// Paths of the stores open in this process
fn open_stores() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN_STORES: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN_STORES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a store file within this process
struct StoreLease {
    path: PathBuf,
}

impl StoreLease {
    fn acquire(path: &Path) -> StorageResult<Self> {
        let path = canonical(path)?;
        let mut open = open_stores().lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(path.clone()) {
            return Err(StorageError::AlreadyOpen { path });
        }
        Ok(Self { path })
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        let mut open = open_stores().lock().unwrap_or_else(|e| e.into_inner());
        open.remove(&self.path);
    }
}

/// Absolute form of a store path whose file may not exist yet
fn canonical(path: &Path) -> StorageResult<PathBuf> {
    ensure_parent(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let parent = fs::canonicalize(parent).map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
    Ok(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}
