//! Stash Core - resumable download queue
//!
//! This crate provides the engine behind Stash: a durable task queue, one
//! streaming transfer per task with pause/resume/cancel, and a publish step
//! that hands finished files over to the gallery.

mod engine;
mod error;
mod notify;
mod persistence;
mod publish;
mod pump;
mod recovery;
mod storage;
mod store;

pub use engine::*;
pub use error::*;
pub use notify::*;
pub use persistence::*;
pub use publish::*;
pub use recovery::*;
pub use storage::*;
pub use store::*;

use pump::EventPump;
use stash_types::{
    CoreEvent, DownloadRequest, DownloadTask, NoticeKind, ResumeSnapshot, Settings, TaskStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What [`StashCore::start_download`] did with a request
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A new task was created and its transfer started
    Started(DownloadTask),
    /// A paused or failed task with the same id was resumed
    Resumed(DownloadTask),
    /// A task with the same id is already queued, running or saving
    AlreadyQueued(DownloadTask),
}

impl StartOutcome {
    pub fn task(&self) -> &DownloadTask {
        match self {
            StartOutcome::Started(task)
            | StartOutcome::Resumed(task)
            | StartOutcome::AlreadyQueued(task) => task,
        }
    }
}

/// The main Stash core instance
pub struct StashCore {
    storage: Storage,
    settings: Settings,
    /// Where transfers write their files
    download_dir: PathBuf,
    store: TaskStore,
    engine: TransferEngine,
    notifier: Arc<dyn NotificationSink>,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    pump: JoinHandle<()>,
}

impl StashCore {
    /// Open the core in `data_dir` with the settings stored there
    pub async fn new(
        data_dir: PathBuf,
        publisher: Arc<dyn GalleryPublisher>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, StashError> {
        let storage = Storage::new(data_dir.clone()).await?;
        let settings = storage.load_settings().await?;
        Self::with_settings(data_dir, settings, publisher, notifier).await
    }

    /// Open the core in `data_dir` with explicit settings
    pub async fn with_settings(
        data_dir: PathBuf,
        settings: Settings,
        publisher: Arc<dyn GalleryPublisher>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, StashError> {
        let storage = Storage::new(data_dir).await?;

        let download_dir = storage.download_dir(&settings);
        fs::create_dir_all(&download_dir).await?;

        // Load the queue; anything that was running is now paused
        let db = QueueDatabase::new(storage.queue_db_path()).await?;
        let store = TaskStore::load(db).await?;

        let (event_tx, _) = broadcast::channel(1000);
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let runs = RunRegistry::new();
        let engine = TransferEngine::new(&settings, publisher, transfer_tx, runs.clone())?;
        let pump = EventPump::new(store.clone(), runs, notifier.clone(), event_tx.clone())
            .spawn(transfer_rx);

        info!(
            "Stash core ready in {} ({} tasks)",
            storage.data_dir().display(),
            store.list().await.len()
        );

        Ok(Self {
            storage,
            settings,
            download_dir,
            store,
            engine,
            notifier,
            event_tx,
            pump,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Local file a task writes to
    pub fn path_for(&self, task: &DownloadTask) -> PathBuf {
        self.download_dir.join(&task.destination_file_name)
    }

    /// Number of transfers currently running
    pub fn active_transfers(&self) -> usize {
        self.engine.active_count()
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Start downloading `request`, or route it to the task that already owns its id
    pub async fn start_download(&self, request: DownloadRequest) -> Result<StartOutcome, StashError> {
        request.validate()?;

        let file_name = self.settings.file_name_for(&request.id);
        let task = DownloadTask::new(request, file_name);

        match self.store.claim(task).await? {
            Claim::Inserted(task) => {
                info!("Starting download {} from {}", task.id, task.source_url);
                self.emit(CoreEvent::TaskUpdated { task: task.clone() });
                self.notify("Download started", NoticeKind::Success);
                self.launch(&task, None)?;
                Ok(StartOutcome::Started(task))
            }
            Claim::Existing(existing)
                if matches!(existing.status, TaskStatus::Paused | TaskStatus::Error) =>
            {
                info!("Task {} is {}, resuming instead", existing.id, existing.status);
                let task = self.resume_download(&existing.id).await?;
                Ok(StartOutcome::Resumed(task))
            }
            Claim::Existing(existing) => {
                debug!("Task {} is already {}", existing.id, existing.status);
                self.notify("Already in queue", NoticeKind::Info);
                Ok(StartOutcome::AlreadyQueued(existing))
            }
        }
    }

    /// Stop a running transfer, keeping what it wrote for a later resume
    pub async fn pause_download(&self, id: &str) -> Result<DownloadTask, StashError> {
        let task = self.get_task(id).await?;

        match task.status {
            TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Error => {}
            // Saving cannot be interrupted; the rest have nothing to pause
            _ => {
                debug!("Pause of task {} in state {} ignored", id, task.status);
                return Ok(task);
            }
        }

        let outcome = self.engine.pause(id).await;
        self.apply_pause(id, outcome).await
    }

    /// Continue a paused or failed task from its snapshot, or from zero without one
    pub async fn resume_download(&self, id: &str) -> Result<DownloadTask, StashError> {
        let mut snapshot: Option<ResumeSnapshot> = None;

        let update = self
            .store
            .update_if(
                id,
                |t| matches!(t.status, TaskStatus::Paused | TaskStatus::Error),
                |t| {
                    snapshot = t.resume_snapshot.take();
                    t.set_status(TaskStatus::Downloading);
                },
            )
            .await?;

        match update {
            Update::Applied(task) => {
                info!(
                    "Resuming task {} ({})",
                    id,
                    if snapshot.is_some() { "from snapshot" } else { "from zero" }
                );
                self.emit(CoreEvent::TaskUpdated { task: task.clone() });
                self.launch(&task, snapshot)?;
                Ok(task)
            }
            Update::Rejected(task) if task.status.is_in_flight() => {
                Err(StashError::AlreadyRunning(id.to_string()))
            }
            Update::Rejected(task) => Err(StashError::InvalidOperation(format!(
                "task {} is {} and cannot be resumed",
                id, task.status
            ))),
            Update::Missing => Err(StashError::NotFound(id.to_string())),
        }
    }

    /// Abort a task and discard its partial file, keeping the record as Cancelled
    pub async fn cancel_download(&self, id: &str) -> Result<DownloadTask, StashError> {
        let task = self.get_task(id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        self.engine.cancel(id).await;
        self.remove_file(&self.path_for(&task)).await;

        let update = self
            .store
            .update_if(
                id,
                |t| !t.status.is_terminal(),
                |t| {
                    t.set_status(TaskStatus::Cancelled);
                    t.reset_progress();
                },
            )
            .await?;

        match update {
            Update::Applied(task) => {
                info!("Cancelled task {}", id);
                self.emit(CoreEvent::TaskUpdated { task: task.clone() });
                Ok(task)
            }
            Update::Rejected(task) => Ok(task),
            Update::Missing => Err(StashError::NotFound(id.to_string())),
        }
    }

    /// Stop the task, delete its file and forget it. Unknown ids are a no-op.
    pub async fn delete_task(&self, id: &str) -> Result<(), StashError> {
        self.engine.cancel(id).await;

        let file_name = match self.store.get(id).await {
            Some(task) => task.destination_file_name,
            None => self.settings.file_name_for(id),
        };
        self.remove_file(&self.download_dir.join(file_name)).await;

        if self.store.remove(id).await?.is_some() {
            info!("Deleted task {}", id);
            self.emit(CoreEvent::TaskRemoved { id: id.to_string() });
            self.notify("Task deleted", NoticeKind::Info);
        }

        Ok(())
    }

    /// All tasks, most recent first
    pub async fn list_tasks(&self) -> Vec<DownloadTask> {
        self.store.list().await
    }

    pub async fn get_task(&self, id: &str) -> Result<DownloadTask, StashError> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| StashError::NotFound(id.to_string()))
    }

    /// Pause every running transfer (used on shutdown)
    pub async fn pause_all(&self) -> Result<(), StashError> {
        let outcomes = self.engine.pause_all().await;
        info!("Pausing {} running transfers", outcomes.len());

        for (id, outcome) in outcomes {
            self.apply_pause(&id, outcome).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn launch(&self, task: &DownloadTask, snapshot: Option<ResumeSnapshot>) -> Result<(), StashError> {
        let job = TransferJob {
            task_id: task.id.clone(),
            url: task.source_url.clone(),
            path: self.path_for(task),
            snapshot,
        };
        self.engine.start(job)?;
        Ok(())
    }

    async fn apply_pause(&self, id: &str, outcome: PauseOutcome) -> Result<DownloadTask, StashError> {
        let update = match outcome {
            PauseOutcome::Paused {
                snapshot,
                bytes_written,
            } => {
                self.store
                    .update_if(
                        id,
                        |t| t.status != TaskStatus::Paused && can_transition(t.status, TaskStatus::Paused),
                        |t| {
                            t.set_status(TaskStatus::Paused);
                            t.record_progress(bytes_written, None);
                            t.resume_snapshot = snapshot;
                        },
                    )
                    .await?
            }
            PauseOutcome::NotRunning => {
                // Nothing to capture; the next resume starts over
                debug!("No live transfer for task {}, marking paused", id);
                self.store
                    .update_if(
                        id,
                        |t| matches!(t.status, TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Error),
                        |t| t.set_status(TaskStatus::Paused),
                    )
                    .await?
            }
            PauseOutcome::Publishing => return self.get_task(id).await,
        };

        match update {
            Update::Applied(task) => {
                self.emit(CoreEvent::TaskUpdated { task: task.clone() });
                Ok(task)
            }
            Update::Rejected(task) => Ok(task),
            Update::Missing => Err(StashError::NotFound(id.to_string())),
        }
    }

    async fn remove_file(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, message: &str, kind: NoticeKind) {
        self.notifier.notify(message, kind);
        self.emit(CoreEvent::Notice {
            message: message.to_string(),
            kind,
        });
    }
}

impl Drop for StashCore {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
