//! Transfer engine - owns every running transfer
//!
//! This is the coordinator that:
//! - Starts one tokio task per transfer
//! - Delivers pause requests and waits for their acknowledgement
//! - Aborts transfers on cancel, including during publishing
//! - Hands out run ids so late messages from old runs can be told apart

use super::transfer::{PauseAck, PauseRequest, Transfer, TransferEvent, TransferJob};
use crate::error::StashError;
use crate::publish::GalleryPublisher;
use crate::recovery::RecoveryPolicy;
use parking_lot::Mutex;
use reqwest::Client;
use stash_types::{ResumeSnapshot, Settings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of [`TransferEngine::pause`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseOutcome {
    /// The transfer stopped; everything up to `bytes_written` is synced to disk
    Paused {
        snapshot: Option<ResumeSnapshot>,
        bytes_written: u64,
    },
    /// No live transfer for the task
    NotRunning,
    /// The file is with the publisher and the run can no longer be paused
    Publishing,
}

/// Latest run id per task
#[derive(Clone, Debug, Default)]
pub struct RunRegistry {
    current: Arc<Mutex<HashMap<String, u64>>>,
    counter: Arc<AtomicU64>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a run id and make it the current one for `task_id`
    pub fn begin(&self, task_id: &str) -> u64 {
        let run = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.lock().insert(task_id.to_string(), run);
        run
    }

    pub fn is_current(&self, task_id: &str, run: u64) -> bool {
        self.current.lock().get(task_id) == Some(&run)
    }

    /// After this, nothing from earlier runs of `task_id` is current
    pub fn retire(&self, task_id: &str) {
        self.current.lock().remove(task_id);
    }
}

/// Handle to a running transfer
struct TransferHandle {
    run: u64,
    control: mpsc::Sender<PauseRequest>,
    join: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<String, TransferHandle>>>;

/// Transfer engine that coordinates all running transfers
pub struct TransferEngine {
    /// Running transfers by task id
    active: ActiveMap,
    runs: RunRegistry,
    client: Client,
    publisher: Arc<dyn GalleryPublisher>,
    events: mpsc::UnboundedSender<TransferEvent>,
    policy: RecoveryPolicy,
    progress_interval: Duration,
}

impl TransferEngine {
    /// Create a new engine reporting to `events`
    pub fn new(
        settings: &Settings,
        publisher: Arc<dyn GalleryPublisher>,
        events: mpsc::UnboundedSender<TransferEvent>,
        runs: RunRegistry,
    ) -> Result<Self, StashError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        Ok(Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            runs,
            client,
            publisher,
            events,
            policy: RecoveryPolicy::new(settings.max_resume_restarts),
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
        })
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Start a run for `job`, seeded by its snapshot if it has one
    pub fn start(&self, job: TransferJob) -> Result<u64, StashError> {
        let task_id = job.task_id.clone();
        let mut active = self.active.lock();

        if let Some(existing) = active.get(&task_id) {
            if !existing.join.is_finished() {
                warn!("Transfer for task {} is already running", task_id);
                return Err(StashError::AlreadyRunning(task_id));
            }
        }

        let run = self.runs.begin(&task_id);
        let (control_tx, control_rx) = mpsc::channel(4);

        let transfer = Transfer::new(
            job,
            run,
            self.client.clone(),
            self.publisher.clone(),
            self.events.clone(),
            control_rx,
            self.policy,
            self.progress_interval,
        );

        let registry = self.active.clone();
        let events = self.events.clone();
        let id = task_id.clone();

        // The map lock is held until the handle is stored, so the cleanup
        // below can never run before the insert
        let join = tokio::spawn(async move {
            let last = transfer.run().await;
            forget(&registry, &id, run);
            if let Some(kind) = last {
                let _ = events.send(TransferEvent {
                    task_id: id,
                    run,
                    kind,
                });
            }
        });

        active.insert(
            task_id.clone(),
            TransferHandle {
                run,
                control: control_tx,
                join,
            },
        );

        debug!("Started run {} for task {}", run, task_id);
        Ok(run)
    }

    /// Ask the transfer for `task_id` to stop and wait until it has
    pub async fn pause(&self, task_id: &str) -> PauseOutcome {
        let (run, control) = {
            let active = self.active.lock();
            match active.get(task_id) {
                Some(handle) if !handle.join.is_finished() => (handle.run, handle.control.clone()),
                _ => return PauseOutcome::NotRunning,
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if control.send(ack_tx).await.is_err() {
            return self.unanswered(task_id, run);
        }

        match ack_rx.await {
            Ok(PauseAck {
                snapshot,
                bytes_written,
            }) => {
                forget(&self.active, task_id, run);
                info!("Paused task {} at byte {}", task_id, bytes_written);
                PauseOutcome::Paused {
                    snapshot,
                    bytes_written,
                }
            }
            Err(_) => self.unanswered(task_id, run),
        }
    }

    /// Pause every running transfer
    pub async fn pause_all(&self) -> Vec<(String, PauseOutcome)> {
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.pause(&id).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Abort the transfer for `task_id`. Returns whether one was running.
    ///
    /// Once this returns the transfer has stopped writing and anything it
    /// had already reported is no longer current.
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.runs.retire(task_id);
        let handle = self.active.lock().remove(task_id);

        match handle {
            Some(handle) => {
                handle.join.abort();
                let _ = handle.join.await;
                info!("Cancelled transfer for task {}", task_id);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active
            .lock()
            .get(task_id)
            .map(|handle| !handle.join.is_finished())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .values()
            .filter(|handle| !handle.join.is_finished())
            .count()
    }

    /// A pause request went unanswered: the run closed its control channel
    fn unanswered(&self, task_id: &str, run: u64) -> PauseOutcome {
        let still_running = self
            .active
            .lock()
            .get(task_id)
            .map(|handle| handle.run == run && !handle.join.is_finished())
            .unwrap_or(false);

        if still_running {
            debug!("Task {} is publishing, pause ignored", task_id);
            PauseOutcome::Publishing
        } else {
            PauseOutcome::NotRunning
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        for (_, handle) in self.active.lock().drain() {
            handle.join.abort();
        }
    }
}

/// Drop the handle for `task_id` if it still belongs to `run`
fn forget(active: &ActiveMap, task_id: &str, run: u64) {
    let mut active = active.lock();
    if active.get(task_id).map(|handle| handle.run) == Some(run) {
        active.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_registry_tracks_latest_run() {
        let runs = RunRegistry::new();
        let first = runs.begin("1");
        let second = runs.begin("1");

        assert_ne!(first, second);
        assert!(!runs.is_current("1", first));
        assert!(runs.is_current("1", second));

        runs.retire("1");
        assert!(!runs.is_current("1", second));
    }

    #[test]
    fn test_run_ids_are_unique_across_tasks() {
        let runs = RunRegistry::new();
        let a = runs.begin("a");
        let b = runs.begin("b");
        assert_ne!(a, b);
        assert!(runs.is_current("a", a));
        assert!(runs.is_current("b", b));
    }
}
