//! Task store - the authoritative, durable list of download tasks
//!
//! Mutations build the next version of the list, write it to the database and
//! only then swap it in, all while holding the write lock. Updates to a record
//! are therefore whole-record replacements applied in the order they were
//! made, and memory never runs ahead of what has been persisted.

use crate::error::StashError;
use crate::persistence::QueueDatabase;
use stash_types::{progress_ratio, DownloadTask, TaskStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{info, warn};

/// Outcome of [`TaskStore::claim`]
#[derive(Debug, Clone)]
pub enum Claim {
    /// No live task had the id; the new record is now at the front of the list
    Inserted(DownloadTask),
    /// A non-terminal task already owns the id and was left untouched
    Existing(DownloadTask),
}

/// Outcome of [`TaskStore::update_if`]
#[derive(Debug, Clone)]
pub enum Update {
    Applied(DownloadTask),
    Rejected(DownloadTask),
    Missing,
}

/// Durable, keyed collection of task records
#[derive(Clone, Debug)]
pub struct TaskStore {
    tasks: Arc<RwLock<Vec<DownloadTask>>>,
    db: QueueDatabase,
}

impl TaskStore {
    /// Load the persisted queue, sanitizing records left behind by a previous process
    pub async fn load(db: QueueDatabase) -> Result<Self, StashError> {
        let stored = db.load_tasks().await?;
        let tasks = sanitize(stored.clone());
        if tasks != stored {
            db.save_tasks(&tasks).await?;
        }

        info!("Loaded {} tasks from storage", tasks.len());

        Ok(Self {
            tasks: Arc::new(RwLock::new(tasks)),
            db,
        })
    }

    /// All tasks, most recent first
    pub async fn list(&self) -> Vec<DownloadTask> {
        self.tasks.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.read().await.iter().find(|t| t.id == id).cloned()
    }

    /// Replace the record with the same id, or insert it at the front
    pub async fn upsert(&self, task: DownloadTask) -> Result<(), StashError> {
        let guard = self.tasks.write().await;
        let mut next = guard.clone();
        match next.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => next.insert(0, task),
        }
        self.commit(guard, next).await
    }

    /// Insert `task` unless a non-terminal task already owns its id.
    ///
    /// Finished records (Success, Cancelled) with the same id are replaced.
    pub async fn claim(&self, task: DownloadTask) -> Result<Claim, StashError> {
        let guard = self.tasks.write().await;

        if let Some(existing) = guard.iter().find(|t| t.id == task.id) {
            if !existing.status.is_terminal() {
                return Ok(Claim::Existing(existing.clone()));
            }
        }

        let mut next = guard.clone();
        next.retain(|t| t.id != task.id);
        next.insert(0, task.clone());
        self.commit(guard, next).await?;

        Ok(Claim::Inserted(task))
    }

    /// Apply `f` to the record with `id`
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<DownloadTask>, StashError>
    where
        F: FnOnce(&mut DownloadTask),
    {
        match self.update_if(id, |_| true, f).await? {
            Update::Applied(task) => Ok(Some(task)),
            Update::Rejected(_) | Update::Missing => Ok(None),
        }
    }

    /// Apply `f` to the record with `id` only if `predicate` holds for its current state
    pub async fn update_if<P, F>(&self, id: &str, predicate: P, f: F) -> Result<Update, StashError>
    where
        P: FnOnce(&DownloadTask) -> bool,
        F: FnOnce(&mut DownloadTask),
    {
        let guard = self.tasks.write().await;

        let Some(index) = guard.iter().position(|t| t.id == id) else {
            return Ok(Update::Missing);
        };
        if !predicate(&guard[index]) {
            return Ok(Update::Rejected(guard[index].clone()));
        }

        let mut next = guard.clone();
        let mut record = next[index].clone();
        f(&mut record);
        record.touch();
        next[index] = record.clone();
        self.commit(guard, next).await?;

        Ok(Update::Applied(record))
    }

    /// Delete the record with `id`
    pub async fn remove(&self, id: &str) -> Result<Option<DownloadTask>, StashError> {
        let guard = self.tasks.write().await;

        let Some(index) = guard.iter().position(|t| t.id == id) else {
            return Ok(None);
        };

        let mut next = guard.clone();
        let removed = next.remove(index);
        self.commit(guard, next).await?;

        Ok(Some(removed))
    }

    /// Persist `next`, then make it the current list
    async fn commit(
        &self,
        mut guard: RwLockWriteGuard<'_, Vec<DownloadTask>>,
        next: Vec<DownloadTask>,
    ) -> Result<(), StashError> {
        self.db.save_tasks(&next).await?;
        *guard = next;
        Ok(())
    }
}

/// Make a freshly loaded queue consistent with "nothing is running yet"
fn sanitize(stored: Vec<DownloadTask>) -> Vec<DownloadTask> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(stored.len());

    for mut task in stored {
        if let Err(e) = task.validate() {
            warn!("Dropping invalid task record {:?}: {}", task.id, e);
            continue;
        }
        if !seen.insert(task.id.clone()) {
            warn!("Dropping duplicate task record {:?}", task.id);
            continue;
        }

        if task.status.is_in_flight() {
            info!("Task {} was {} when the process stopped, marking paused", task.id, task.status);
            task.status = TaskStatus::Paused;
        }
        if task.status != TaskStatus::Error {
            task.error_message = None;
        }
        if task.status != TaskStatus::Paused {
            task.resume_snapshot = None;
        }
        task.progress = progress_ratio(task.bytes_written, task.bytes_total);

        tasks.push(task);
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CORRUPT_TASKS_KEY, TASKS_KEY};
    use stash_types::{DownloadRequest, ResumeSnapshot};
    use tempfile::TempDir;

    fn task(id: &str) -> DownloadTask {
        let request = DownloadRequest::new(id, format!("https://example.com/{}.jpg", id));
        DownloadTask::new(request, format!("stash_{}.jpg", id))
    }

    async fn open(dir: &TempDir) -> TaskStore {
        let db = QueueDatabase::new(dir.path().join("queue.db")).await.unwrap();
        TaskStore::load(db).await.unwrap()
    }

    #[tokio::test]
    async fn test_reload_rewrites_downloading_to_paused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut running = task("1");
        running.set_status(TaskStatus::Downloading);
        running.record_progress(500, Some(1000));
        store.upsert(running).await.unwrap();

        let mut done = task("2");
        done.set_status(TaskStatus::Success);
        store.upsert(done).await.unwrap();
        drop(store);

        let reloaded = open(&dir).await;
        let first = reloaded.get("1").await.unwrap();
        assert_eq!(first.status, TaskStatus::Paused);
        assert_eq!(first.bytes_written, 500);
        assert_eq!(reloaded.get("2").await.unwrap().status, TaskStatus::Success);

        // The sanitized state is what is on disk now as well
        let again = open(&dir).await;
        assert_eq!(again.get("1").await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_load_does_not_overwrite_unreadable_queue() {
        let dir = tempfile::tempdir().unwrap();
        let db = QueueDatabase::new(dir.path().join("queue.db")).await.unwrap();
        db.write(TASKS_KEY, "[{\"id\": truncated").await.unwrap();

        let store = TaskStore::load(db.clone()).await.unwrap();
        assert!(store.list().await.is_empty());

        assert_eq!(
            db.read(TASKS_KEY).await.unwrap().as_deref(),
            Some("[{\"id\": truncated")
        );
        assert!(db.read(CORRUPT_TASKS_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reload_pauses_queued_and_saving_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        store.upsert(task("queued")).await.unwrap();
        let mut saving = task("saving");
        saving.set_status(TaskStatus::Saving);
        store.upsert(saving).await.unwrap();
        drop(store);

        let reloaded = open(&dir).await;
        for task in reloaded.list().await {
            assert_eq!(task.status, TaskStatus::Paused, "task {}", task.id);
        }
    }

    #[tokio::test]
    async fn test_reload_drops_stale_snapshot_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut stale = task("3");
        stale.status = TaskStatus::Success;
        stale.error_message = Some("leftover".to_string());
        stale.resume_snapshot = Some(ResumeSnapshot::new("leftover"));
        store.upsert(stale).await.unwrap();
        drop(store);

        let reloaded = open(&dir).await.get("3").await.unwrap();
        assert!(reloaded.error_message.is_none());
        assert!(reloaded.resume_snapshot.is_none());
    }

    #[tokio::test]
    async fn test_claim_dedups_live_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        assert!(matches!(store.claim(task("9")).await.unwrap(), Claim::Inserted(_)));
        assert!(matches!(store.claim(task("9")).await.unwrap(), Claim::Existing(_)));
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_replaces_finished_task_at_front() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut finished = task("a");
        finished.set_status(TaskStatus::Success);
        finished.record_progress(10, Some(10));
        store.upsert(finished).await.unwrap();
        store.upsert(task("b")).await.unwrap();

        let claimed = store.claim(task("a")).await.unwrap();
        assert!(matches!(claimed, Claim::Inserted(_)));

        let ids: Vec<_> = store.list().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get("a").await.unwrap().bytes_written, 0);
    }

    #[tokio::test]
    async fn test_update_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(task("5")).await.unwrap();

        let updated = store
            .update("5", |t| t.fail("Download failed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Error);
        drop(store);

        let reloaded = open(&dir).await.get("5").await.unwrap();
        assert_eq!(reloaded.error_message.as_deref(), Some("Download failed"));
    }

    #[tokio::test]
    async fn test_update_if_rejects_when_predicate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(task("6")).await.unwrap();

        let result = store
            .update_if(
                "6",
                |t| t.status == TaskStatus::Paused,
                |t| t.set_status(TaskStatus::Downloading),
            )
            .await
            .unwrap();
        assert!(matches!(result, Update::Rejected(ref t) if t.status == TaskStatus::Queued));

        let missing = store.update_if("nope", |_| true, |_| {}).await.unwrap();
        assert!(matches!(missing, Update::Missing));
    }

    #[tokio::test]
    async fn test_remove_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(task("x")).await.unwrap();

        assert!(store.remove("x").await.unwrap().is_some());
        assert!(store.remove("x").await.unwrap().is_none());
        drop(store);

        assert!(open(&dir).await.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(task("c")).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=20u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("c", |t| t.record_progress(i * 10, Some(i * 20)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Whichever update landed last, its fields arrived together
        let task = store.get("c").await.unwrap();
        assert_eq!(task.bytes_total, Some(task.bytes_written * 2));
    }
}
