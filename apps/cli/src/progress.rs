//! Progress bars for tasks followed in the foreground

use anyhow::{bail, Result};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use stash_core::StashCore;
use stash_types::{CoreEvent, DownloadTask, TaskStatus};
use tokio::sync::broadcast::{self, error::RecvError};

/// Draws one bar per followed task
pub struct TaskProgress {
    multi: MultiProgress,
}

impl TaskProgress {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi }
    }

    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    fn add_bar(&self, task: &DownloadTask) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(task.bytes_total.unwrap_or(0)));

        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  "),
        );
        pb.set_message(task.destination_file_name.clone());
        update(&pb, task);
        pb
    }

    /// Follow `id` until it settles. Ctrl-C pauses every running transfer.
    ///
    /// `events` must be subscribed before the task was started so no update is missed.
    pub async fn follow(
        &self,
        core: &StashCore,
        mut events: broadcast::Receiver<CoreEvent>,
        id: &str,
    ) -> Result<DownloadTask> {
        let current = core.get_task(id).await?;
        let pb = self.add_bar(&current);
        if settled(current.status) {
            finish(&pb, &current);
            return Ok(current);
        }

        loop {
            tokio::select! {
                event = events.recv() => {
                    let task = match event {
                        Ok(CoreEvent::TaskUpdated { task }) if task.id == id => task,
                        Ok(CoreEvent::TaskRemoved { id: removed }) if removed == id => {
                            pb.abandon_with_message(format!("{} Deleted", style("○").dim()));
                            bail!("Task {} was deleted", id);
                        }
                        Ok(_) => continue,
                        // Missed some updates; the store has the latest state
                        Err(RecvError::Lagged(_)) => core.get_task(id).await?,
                        Err(RecvError::Closed) => bail!("Core stopped while following task {}", id),
                    };

                    update(&pb, &task);
                    if settled(task.status) {
                        finish(&pb, &task);
                        return Ok(task);
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    pb.set_message("pausing...");
                    core.pause_all().await?;
                    let task = core.get_task(id).await?;
                    finish(&pb, &task);
                    return Ok(task);
                }
            }
        }
    }
}

fn settled(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled | TaskStatus::Paused
    )
}

fn update(pb: &ProgressBar, task: &DownloadTask) {
    match task.bytes_total {
        Some(total) => pb.set_length(total),
        None => pb.unset_length(),
    }
    pb.set_position(task.bytes_written);
    if task.status == TaskStatus::Saving {
        pb.set_message("saving to gallery");
    }
}

fn finish(pb: &ProgressBar, task: &DownloadTask) {
    match task.status {
        TaskStatus::Success => {
            pb.finish_with_message(format!("{} Saved to gallery", style("✓").green().bold()));
        }
        TaskStatus::Error => {
            pb.abandon_with_message(format!(
                "{} {}",
                style("✗").red().bold(),
                task.error_message.as_deref().unwrap_or("Download failed")
            ));
        }
        TaskStatus::Paused => {
            pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
        }
        TaskStatus::Cancelled => {
            pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
        }
        _ => pb.abandon(),
    }
}
