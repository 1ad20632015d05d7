//! Crystal: lifecycle coordinator of the engine
//!
//! Owns the storage and journal backends, the data tree, the Himo cache and
//! the background threads, and sequences them through start, crystallize,
//! stop and abort.
//!
//! # Start
//!
//! ```text
//! prepare storage   (ask UserQuery when the check file is missing)
//! prepare journal   (ask UserQuery about each inconsistent book)
//! repair journal    (truncate torn books once every answer was Continue)
//! load root
//! replay journal    (then crystallize, so replayed state reaches storage)
//! start Himo task
//! start periodic task (policy Periodic)
//! ```
//!
//! # Stop
//!
//! ```text
//! stop periodic task → crystallize → stop Himo task → close journal → close storage
//! ```
//!
//! Panics raised inside start or stop are caught and reported as `FileError`.

use crate::background::BackgroundTask;
use crate::config::{ConfigError, CrystalConfig, CrystallizationPolicy, CONFIG_FILE_NAME};
use crate::context::TreeContext;
use crate::himo::{Himo, SweepStats};
use crate::node::DataNode;
use crate::registry::DatumRegistry;
use crate::replay::{replay, ReplayStats};
use crate::user_query::{NonInteractive, QueryAnswer, UserQuery};
use crystal_core::{BufferPool, CrystalError, CrystalResult};
use crystal_durability::{CheckpointMark, FileJournal, Journal, NullJournal};
use crystal_storage::{FileStorage, NullStorage, Storage, StorageCheck};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Data directories claimed by running coordinators in this process
static OPEN_DIRECTORIES: Lazy<Mutex<FxHashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(FxHashSet::default()));

/// Exclusive use of a data directory, released on drop
struct DirectoryClaim(PathBuf);

impl DirectoryClaim {
    fn acquire(dir: &Path) -> Option<Self> {
        let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if OPEN_DIRECTORIES.lock().insert(key.clone()) {
            Some(DirectoryClaim(key))
        } else {
            None
        }
    }
}

impl Drop for DirectoryClaim {
    fn drop(&mut self) {
        OPEN_DIRECTORIES.lock().remove(&self.0);
    }
}

/// Parameters of [`Crystal::start`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartParam {
    /// Discard existing storage and journal and start from an empty tree
    pub create_new: bool,
}

impl StartParam {
    /// Continue from what is on disk
    pub fn resume() -> Self {
        StartParam { create_new: false }
    }

    /// Start from an empty store
    pub fn create_new() -> Self {
        StartParam { create_new: true }
    }
}

/// Parameters of [`Crystal::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopParam {
    /// Save the tree before closing (default: true)
    pub crystallize: bool,
}

impl Default for StopParam {
    fn default() -> Self {
        StopParam { crystallize: true }
    }
}

impl StopParam {
    /// Close without a final save; the journal still covers unsaved writes
    pub fn without_crystallize() -> Self {
        StopParam { crystallize: false }
    }
}

/// Outcome of [`Crystal::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// Running
    Success,
    /// Already running; nothing changed
    AlreadyStarted,
    /// Configuration, storage or tree loading failed
    FileError,
    /// The journal could not be opened or replayed
    JournalError,
    /// A `UserQuery` answered `Abort`
    Aborted,
}

impl StartResult {
    /// Whether the coordinator is running afterwards
    pub fn is_success(&self) -> bool {
        matches!(self, StartResult::Success)
    }
}

/// Outcome of [`Crystal::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// Saved (if requested) and closed
    Success,
    /// Was not running
    NotStarted,
    /// Stopped, but saving or closing reported an error
    FileError,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrystalState {
    /// Not started, stopped or aborted
    Stopped,
    /// Started and accepting operations
    Running,
}

struct Session {
    ctx: Arc<TreeContext>,
    root: Arc<DataNode>,
    himo_task: Option<BackgroundTask>,
    periodic_task: Option<BackgroundTask>,
    _claim: Option<DirectoryClaim>,
}

impl Session {
    fn stop_tasks(&mut self) {
        if let Some(task) = self.periodic_task.take() {
            task.stop();
        }
        if let Some(task) = self.himo_task.take() {
            task.stop();
        }
    }
}

/// Engine coordinator
pub struct Crystal {
    data_dir: PathBuf,
    config: CrystalConfig,
    registry: Arc<DatumRegistry>,
    user_query: Arc<dyn UserQuery>,
    pool: BufferPool,
    session: Mutex<Option<Session>>,
}

impl Crystal {
    /// Coordinator over `data_dir` with an explicit configuration.
    ///
    /// Buffers come from a pool sized by `config.filer.pool_per_class`.
    pub fn new(data_dir: impl Into<PathBuf>, config: CrystalConfig, registry: DatumRegistry) -> Self {
        let pool = BufferPool::new(config.filer.pool_per_class);
        Crystal {
            data_dir: data_dir.into(),
            config,
            registry: Arc::new(registry),
            user_query: Arc::new(NonInteractive),
            pool,
            session: Mutex::new(None),
        }
    }

    /// Coordinator configured from `crystal.toml` in `data_dir`.
    ///
    /// The directory and a default config file are created when missing.
    pub fn open(data_dir: impl Into<PathBuf>, registry: DatumRegistry) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| ConfigError::Io {
            path: data_dir.clone(),
            message: e.to_string(),
        })?;
        let path = data_dir.join(CONFIG_FILE_NAME);
        CrystalConfig::write_default_if_missing(&path)?;
        let config = CrystalConfig::from_file(&path)?;
        Ok(Self::new(data_dir, config, registry))
    }

    /// Replace the start-up decision hook (builder pattern)
    pub fn with_user_query(mut self, user_query: Arc<dyn UserQuery>) -> Self {
        self.user_query = user_query;
        self
    }

    /// Use a private buffer pool (builder pattern)
    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Active configuration
    pub fn config(&self) -> &CrystalConfig {
        &self.config
    }

    /// Buffer pool shared by storage, journal and data units
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Registered datum types
    pub fn registry(&self) -> &DatumRegistry {
        &self.registry
    }

    /// Lifecycle state
    pub fn state(&self) -> CrystalState {
        if self.session.lock().is_some() {
            CrystalState::Running
        } else {
            CrystalState::Stopped
        }
    }

    /// Open backends, load and replay the tree, start background threads
    pub fn start(&self, param: StartParam) -> StartResult {
        let mut session = self.session.lock();
        if session.is_some() {
            return StartResult::AlreadyStarted;
        }
        info!(
            dir = %self.data_dir.display(),
            policy = ?self.config.crystallization,
            create_new = param.create_new,
            "Starting crystal"
        );
        match panic::catch_unwind(AssertUnwindSafe(|| self.open_session(param))) {
            Ok(Ok(opened)) => {
                *session = Some(opened);
                info!(dir = %self.data_dir.display(), "Crystal started");
                StartResult::Success
            }
            Ok(Err(result)) => {
                warn!(?result, "Crystal failed to start");
                result
            }
            Err(_) => {
                error!("Panic while starting crystal");
                StartResult::FileError
            }
        }
    }

    fn open_session(&self, param: StartParam) -> Result<Session, StartResult> {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid configuration");
            return Err(StartResult::FileError);
        }
        let policy = self.config.crystallization;

        let claim = if policy.persists() {
            if let Err(e) = std::fs::create_dir_all(&self.data_dir) {
                error!(dir = %self.data_dir.display(), error = %e, "Cannot create data directory");
                return Err(StartResult::FileError);
            }
            match DirectoryClaim::acquire(&self.data_dir) {
                Some(claim) => Some(claim),
                None => {
                    error!(dir = %self.data_dir.display(), "Data directory already in use");
                    return Err(StartResult::FileError);
                }
            }
        } else {
            None
        };

        let storage = self.open_storage(param)?;
        let journal = self.open_journal(param, storage.as_ref())?;
        let scan = match journal.prepare() {
            Ok(scan) => scan,
            Err(e) => {
                error!(error = %e, "Journal prepare failed");
                storage.abort();
                return Err(StartResult::JournalError);
            }
        };
        for path in &scan.inconsistent {
            if self.user_query.inconsistent_journal(path) == QueryAnswer::Abort {
                warn!(path = %path.display(), "Start aborted on inconsistent journal");
                journal.abort();
                storage.abort();
                return Err(StartResult::Aborted);
            }
        }
        if let Err(e) = journal.repair(&scan) {
            error!(error = %e, "Journal repair failed");
            journal.abort();
            storage.abort();
            return Err(StartResult::JournalError);
        }

        let ctx = Arc::new(TreeContext::new(
            Arc::clone(&storage),
            Arc::clone(&journal),
            Arc::clone(&self.registry),
            Himo::new(&self.config.himo),
            self.pool.clone(),
            policy,
            self.config.storage.wait(),
        ));
        let root = match DataNode::load_root(&ctx) {
            Ok(root) => root,
            Err(e) => {
                error!(error = %e, "Failed to load data tree");
                journal.abort();
                storage.abort();
                return Err(StartResult::FileError);
            }
        };

        let stats: ReplayStats = replay(&ctx, &root, &scan);
        drop(scan);
        if stats.applied > 0 && storage.is_persistent() {
            if let Err(e) = crystallize_tree(&ctx, &root) {
                error!(error = %e, "Failed to save replayed tree");
                journal.abort();
                storage.abort();
                return Err(StartResult::JournalError);
            }
        }

        let himo_task = {
            let ctx = Arc::clone(&ctx);
            BackgroundTask::spawn("crystal-himo", self.config.himo.interval(), move || {
                ctx.himo.sweep(&ctx);
            })
        };
        let himo_task = match himo_task {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Failed to spawn Himo thread");
                journal.abort();
                storage.abort();
                return Err(StartResult::FileError);
            }
        };

        let periodic_task = if policy == CrystallizationPolicy::Periodic {
            let (ctx, root) = (Arc::clone(&ctx), Arc::clone(&root));
            let task = BackgroundTask::spawn("crystal-periodic", self.config.interval(), move || {
                if let Err(e) = crystallize_tree(&ctx, &root) {
                    warn!(error = %e, "Periodic crystallization failed");
                }
            });
            match task {
                Ok(task) => Some(task),
                Err(e) => {
                    error!(error = %e, "Failed to spawn periodic save thread");
                    himo_task.stop();
                    journal.abort();
                    storage.abort();
                    return Err(StartResult::FileError);
                }
            }
        } else {
            None
        };

        Ok(Session {
            ctx,
            root,
            himo_task: Some(himo_task),
            periodic_task,
            _claim: claim,
        })
    }

    fn open_storage(&self, param: StartParam) -> Result<Arc<dyn Storage>, StartResult> {
        let storage: Arc<dyn Storage> = if self.config.crystallization.persists() {
            Arc::new(FileStorage::new(
                self.data_dir.join(&self.config.storage.directory),
                &self.config.filer,
                self.config.storage.clone(),
                self.pool.clone(),
            ))
        } else {
            Arc::new(NullStorage::new())
        };

        match storage.prepare_and_check(param.create_new) {
            Ok(StorageCheck::CheckFileMissing {
                recovered_next_id,
                object_count,
            }) => {
                warn!(
                    next_id = recovered_next_id,
                    objects = object_count,
                    "Storage check file missing, continuing starts an empty tree"
                );
                if self.user_query.no_check_file() == QueryAnswer::Abort {
                    storage.abort();
                    return Err(StartResult::Aborted);
                }
                warn!(
                    objects = object_count,
                    "Stored objects are unreachable from the new tree"
                );
            }
            Ok(check) => debug!(?check, backend = storage.backend_name(), "Storage prepared"),
            Err(e) => {
                error!(error = %e, "Storage prepare failed");
                storage.abort();
                return Err(StartResult::FileError);
            }
        }
        Ok(storage)
    }

    fn open_journal(
        &self,
        param: StartParam,
        storage: &dyn Storage,
    ) -> Result<Arc<dyn Journal>, StartResult> {
        let dir = self.data_dir.join(&self.config.journal.directory);
        if param.create_new && self.config.crystallization.persists() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!(dir = %dir.display(), "Discarded old journal"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "Cannot discard old journal");
                    storage.abort();
                    return Err(StartResult::JournalError);
                }
            }
        }
        if self.config.crystallization.journals() && self.config.journal.enabled {
            Ok(Arc::new(FileJournal::new(
                dir,
                &self.config.filer,
                self.config.journal.clone(),
                self.pool.clone(),
            )))
        } else {
            Ok(Arc::new(NullJournal::new(self.pool.clone())))
        }
    }

    /// Save the whole tree and checkpoint the journal
    pub fn crystallize(&self) -> CrystalResult<()> {
        let (ctx, root) = self.running()?;
        crystallize_tree(&ctx, &root)
    }

    /// Write buffered journal records to disk without saving the tree
    pub fn flush_journal(&self) -> CrystalResult<()> {
        let (ctx, _) = self.running()?;
        ctx.journal.flush(ctx.wait)
    }

    /// Stop background threads, save (unless disabled) and close backends
    pub fn stop(&self, param: StopParam) -> StopResult {
        let mut session = self.session.lock();
        let current = match session.take() {
            Some(current) => current,
            None => return StopResult::NotStarted,
        };
        info!(dir = %self.data_dir.display(), crystallize = param.crystallize, "Stopping crystal");
        match panic::catch_unwind(AssertUnwindSafe(|| close_session(current, param))) {
            Ok(result) => {
                info!(?result, "Crystal stopped");
                result
            }
            Err(_) => {
                error!("Panic while stopping crystal");
                StopResult::FileError
            }
        }
    }

    /// Stop background threads and drop queued writes without saving
    pub fn abort(&self) {
        let current = self.session.lock().take();
        if let Some(mut current) = current {
            current.stop_tasks();
            current.ctx.journal.abort();
            current.ctx.storage.abort();
            warn!(dir = %self.data_dir.display(), "Crystal aborted");
        }
    }

    /// Root node
    pub fn root(&self) -> CrystalResult<Arc<DataNode>> {
        Ok(self.running()?.1)
    }

    /// Node at a slash-separated path; `/` and `""` name the root
    pub fn find(&self, path: &str) -> CrystalResult<Option<Arc<DataNode>>> {
        let (_, root) = self.running()?;
        root.descendant(path.split('/').filter(|part| !part.is_empty()))
    }

    /// Resident data bytes; 0 when stopped
    pub fn memory_usage(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |s| s.ctx.himo.memory_usage())
    }

    /// Number of data units holding content; 0 when stopped
    pub fn resident_count(&self) -> usize {
        let ctx = match self.running() {
            Ok((ctx, _)) => ctx,
            Err(_) => return 0,
        };
        ctx.himo.resident_count()
    }

    /// Run one eviction cycle now
    pub fn sweep(&self) -> CrystalResult<SweepStats> {
        let (ctx, _) = self.running()?;
        Ok(ctx.himo.sweep(&ctx))
    }

    /// Unflushed journal bytes held in memory
    pub fn journal_resident_bytes(&self) -> u64 {
        self.running()
            .map_or(0, |(ctx, _)| ctx.journal.resident_bytes())
    }

    fn running(&self) -> CrystalResult<(Arc<TreeContext>, Arc<DataNode>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (Arc::clone(&s.ctx), Arc::clone(&s.root)))
            .ok_or(CrystalError::NotStarted)
    }
}

impl Drop for Crystal {
    fn drop(&mut self) {
        if self.session.get_mut().is_some() {
            let result = self.stop(StopParam::default());
            if result != StopResult::Success {
                warn!(?result, "Crystal stopped on drop with errors");
            }
        }
    }
}

/// Checkpoint-begin → save tree → set root pointer → flush → purge → checkpoint-complete
pub(crate) fn crystallize_tree(ctx: &TreeContext, root: &DataNode) -> CrystalResult<()> {
    let _guard = ctx.save_lock.lock();
    let started = Instant::now();
    let garbage = ctx.take_retired();
    let committed = commit_tree(ctx, root);
    match &committed {
        Ok(_) => ctx.purge(garbage),
        Err(_) => ctx.restore_retired(garbage),
    }
    let mark = committed?;
    ctx.journal.complete_checkpoint(mark, ctx.wait)?;
    info!(
        checkpoint = mark.number,
        root = %ctx.storage.root(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Crystallized"
    );
    Ok(())
}

/// Write the tree and point storage at it.
///
/// Saves only ever add objects, so when part of the tree fails the root
/// written here still names a complete earlier version of that part. The
/// failure is reported after the root pointer moved.
fn commit_tree(ctx: &TreeContext, root: &DataNode) -> CrystalResult<CheckpointMark> {
    let mark = ctx.journal.begin_checkpoint()?;
    let saved = root.save(true, false);
    ctx.storage.set_root(root.manifest_id(), ctx.wait)?;
    ctx.storage.flush(ctx.wait)?;
    saved?;
    Ok(mark)
}

fn close_session(mut session: Session, param: StopParam) -> StopResult {
    let mut result = StopResult::Success;
    if let Some(task) = session.periodic_task.take() {
        task.stop();
    }
    if param.crystallize {
        if let Err(e) = crystallize_tree(&session.ctx, &session.root) {
            error!(error = %e, "Final crystallization failed");
            result = StopResult::FileError;
        }
    }
    if let Some(task) = session.himo_task.take() {
        task.stop();
    }
    if let Err(e) = session.ctx.journal.close() {
        error!(error = %e, "Journal close failed");
        result = StopResult::FileError;
    }
    if let Err(e) = session.ctx.storage.close() {
        error!(error = %e, "Storage close failed");
        result = StopResult::FileError;
    }
    result
}

impl std::fmt::Debug for Crystal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crystal")
            .field("data_dir", &self.data_dir)
            .field("policy", &self.config.crystallization)
            .field("state", &self.state())
            .finish()
    }
}
