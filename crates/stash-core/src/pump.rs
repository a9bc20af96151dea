//! Event pump - the single consumer of transfer events
//!
//! Events are applied in the order they were sent. Events from runs that are
//! no longer current are dropped, and every event only applies to the state
//! it was produced for, so a late message can never undo a pause or a cancel.

use crate::engine::{RunRegistry, TransferEvent, TransferEventKind};
use crate::error::StashError;
use crate::notify::NotificationSink;
use crate::recovery::{can_transition, FailureKind};
use crate::store::{TaskStore, Update};
use stash_types::{CoreEvent, DownloadTask, NoticeKind, TaskStatus};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub(crate) struct EventPump {
    store: TaskStore,
    runs: RunRegistry,
    notifier: Arc<dyn NotificationSink>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl EventPump {
    pub(crate) fn new(
        store: TaskStore,
        runs: RunRegistry,
        notifier: Arc<dyn NotificationSink>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            store,
            runs,
            notifier,
            event_tx,
        }
    }

    pub(crate) fn spawn(self, mut rx: mpsc::UnboundedReceiver<TransferEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let id = event.task_id.clone();
                if let Err(e) = self.apply(event).await {
                    error!("Failed to record transfer event for task {}: {}", id, e);
                }
            }
            debug!("Event pump stopped");
        })
    }

    /// Apply one event; returns the updated record if anything changed
    pub(crate) async fn apply(&self, event: TransferEvent) -> Result<Option<DownloadTask>, StashError> {
        if !self.runs.is_current(&event.task_id, event.run) {
            debug!("Dropping event from old run {} of task {}", event.run, event.task_id);
            return Ok(None);
        }

        let id = event.task_id.as_str();
        let mut notice = None;

        let update = match event.kind {
            TransferEventKind::Started { offset } => {
                self.store
                    .update_if(
                        id,
                        |t| matches!(t.status, TaskStatus::Queued | TaskStatus::Downloading),
                        |t| {
                            t.set_status(TaskStatus::Downloading);
                            if offset == 0 {
                                t.reset_progress();
                            }
                        },
                    )
                    .await?
            }
            TransferEventKind::Progress { written, total } => {
                self.store
                    .update_if(
                        id,
                        |t| t.status == TaskStatus::Downloading,
                        |t| t.record_progress(written, total),
                    )
                    .await?
            }
            TransferEventKind::Restarted => {
                self.store
                    .update_if(id, |t| t.status == TaskStatus::Downloading, |t| t.reset_progress())
                    .await?
            }
            TransferEventKind::Saving { written, total } => {
                self.store
                    .update_if(
                        id,
                        |t| t.status == TaskStatus::Downloading,
                        |t| {
                            t.record_progress(written, total);
                            t.set_status(TaskStatus::Saving);
                        },
                    )
                    .await?
            }
            TransferEventKind::Succeeded => {
                notice = Some(("Saved to gallery".to_string(), NoticeKind::Success));
                self.store
                    .update_if(
                        id,
                        |t| t.status == TaskStatus::Saving,
                        |t| t.set_status(TaskStatus::Success),
                    )
                    .await?
            }
            TransferEventKind::Failed(failure) => {
                let target = failure.kind.status();
                if let Some(text) = failure.kind.notice() {
                    notice = Some((text.to_string(), NoticeKind::Error));
                }
                self.store
                    .update_if(
                        id,
                        |t| t.status.is_in_flight() && can_transition(t.status, target),
                        |t| {
                            if failure.kind == FailureKind::UserCancelled {
                                t.set_status(TaskStatus::Cancelled);
                            } else {
                                t.fail(failure.message());
                            }
                        },
                    )
                    .await?
            }
        };

        match update {
            Update::Applied(task) => {
                let _ = self.event_tx.send(CoreEvent::TaskUpdated { task: task.clone() });
                if let Some((message, kind)) = notice {
                    self.notifier.notify(&message, kind);
                    let _ = self.event_tx.send(CoreEvent::Notice { message, kind });
                }
                Ok(Some(task))
            }
            Update::Rejected(task) => {
                debug!("Ignoring event for task {} in state {}", id, task.status);
                Ok(None)
            }
            Update::Missing => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskFailure;
    use crate::persistence::QueueDatabase;
    use parking_lot::Mutex;
    use stash_types::DownloadRequest;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(String, NoticeKind)>>);

    impl NotificationSink for Recorded {
        fn notify(&self, message: &str, kind: NoticeKind) {
            self.0.lock().push((message.to_string(), kind));
        }
    }

    struct Fixture {
        pump: EventPump,
        store: TaskStore,
        runs: RunRegistry,
        notices: Arc<Recorded>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(id: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = QueueDatabase::new(dir.path().join("queue.db")).await.unwrap();
        let store = TaskStore::load(db).await.unwrap();

        let request = DownloadRequest::new(id, format!("https://example.com/{}.jpg", id));
        store
            .upsert(DownloadTask::new(request, format!("stash_{}.jpg", id)))
            .await
            .unwrap();

        let runs = RunRegistry::new();
        let notices = Arc::new(Recorded::default());
        let (event_tx, _) = broadcast::channel(64);
        let pump = EventPump::new(store.clone(), runs.clone(), notices.clone(), event_tx);

        Fixture {
            pump,
            store,
            runs,
            notices,
            _dir: dir,
        }
    }

    fn event(id: &str, run: u64, kind: TransferEventKind) -> TransferEvent {
        TransferEvent {
            task_id: id.to_string(),
            run,
            kind,
        }
    }

    #[tokio::test]
    async fn test_progress_sequence_reaches_success() {
        let f = fixture("42").await;
        let run = f.runs.begin("42");
        let total = Some(10_000_000);

        f.pump
            .apply(event("42", run, TransferEventKind::Started { offset: 0 }))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for written in [2_000_000, 4_000_000, 6_000_000, 8_000_000, 10_000_000] {
            let task = f
                .pump
                .apply(event("42", run, TransferEventKind::Progress { written, total }))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.status, TaskStatus::Downloading);
            seen.push(task.progress);
        }
        let expected = [0.2, 0.4, 0.6, 0.8, 1.0];
        for (got, want) in seen.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }

        let saving = f
            .pump
            .apply(event(
                "42",
                run,
                TransferEventKind::Saving {
                    written: 10_000_000,
                    total,
                },
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saving.status, TaskStatus::Saving);

        let done = f
            .pump
            .apply(event("42", run, TransferEventKind::Succeeded))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(
            f.notices.0.lock().clone(),
            vec![("Saved to gallery".to_string(), NoticeKind::Success)]
        );
    }

    #[tokio::test]
    async fn test_events_from_old_runs_are_dropped() {
        let f = fixture("7").await;
        let old = f.runs.begin("7");
        let new = f.runs.begin("7");

        f.pump
            .apply(event("7", new, TransferEventKind::Started { offset: 0 }))
            .await
            .unwrap();

        let stale = f
            .pump
            .apply(event(
                "7",
                old,
                TransferEventKind::Progress {
                    written: 90,
                    total: Some(100),
                },
            ))
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(f.store.get("7").await.unwrap().bytes_written, 0);
    }

    #[tokio::test]
    async fn test_progress_is_ignored_once_paused() {
        let f = fixture("p").await;
        let run = f.runs.begin("p");
        f.store
            .update("p", |t| t.set_status(TaskStatus::Paused))
            .await
            .unwrap();

        let result = f
            .pump
            .apply(event(
                "p",
                run,
                TransferEventKind::Progress {
                    written: 5,
                    total: Some(10),
                },
            ))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(f.store.get("p").await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_restart_resets_progress() {
        let f = fixture("r").await;
        let run = f.runs.begin("r");
        f.pump
            .apply(event("r", run, TransferEventKind::Started { offset: 50 }))
            .await
            .unwrap();
        f.pump
            .apply(event(
                "r",
                run,
                TransferEventKind::Progress {
                    written: 50,
                    total: Some(100),
                },
            ))
            .await
            .unwrap();

        let task = f
            .pump
            .apply(event("r", run, TransferEventKind::Restarted))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.bytes_written, 0);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.status, TaskStatus::Downloading);
    }

    #[tokio::test]
    async fn test_failure_marks_error_and_notifies() {
        let f = fixture("e").await;
        let run = f.runs.begin("e");

        let failure = TaskFailure {
            kind: FailureKind::PermissionDenied,
            detail: "gallery is read-only".to_string(),
        };
        let task = f
            .pump
            .apply(event("e", run, TransferEventKind::Failed(failure)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(
            task.error_message.as_deref(),
            Some("Permission denied: gallery is read-only")
        );
        assert_eq!(
            f.notices.0.lock().clone(),
            vec![("Permission denied".to_string(), NoticeKind::Error)]
        );
    }

    #[tokio::test]
    async fn test_cancellation_is_not_an_error() {
        let f = fixture("c").await;
        let run = f.runs.begin("c");
        f.pump
            .apply(event("c", run, TransferEventKind::Started { offset: 0 }))
            .await
            .unwrap();

        let failure = TaskFailure {
            kind: FailureKind::UserCancelled,
            detail: "Transfer aborted".to_string(),
        };
        let task = f
            .pump
            .apply(event("c", run, TransferEventKind::Failed(failure)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error_message.is_none());
        assert!(f.notices.0.lock().is_empty());
    }
}
