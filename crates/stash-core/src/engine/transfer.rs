//! Transfer - one run of one task
//!
//! Streams the source into the destination file, then hands the finished file
//! to the publisher. A run listens on its control channel while connecting and
//! between chunks; a pause request is answered only after the file has been
//! flushed and synced. Once publishing starts the control channel is closed and
//! the run can only be aborted.

use super::snapshot::{ContentRange, ResumeState, Validators};
use crate::error::TransferError;
use crate::publish::{GalleryPublisher, PublishError};
use crate::recovery::{classify, Decision, FailureKind, RecoveryPolicy};
use futures::StreamExt;
use reqwest::header::{IF_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use stash_types::ResumeSnapshot;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Message from a running transfer, tagged with the run that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub task_id: String,
    pub run: u64,
    pub kind: TransferEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    /// Permission granted; `offset` is where the run intends to continue
    Started { offset: u64 },
    Progress { written: u64, total: Option<u64> },
    /// A resume was rejected; the file starts over at byte zero
    Restarted,
    /// Every byte is on disk and the publisher has been called
    Saving { written: u64, total: Option<u64> },
    Succeeded,
    Failed(TaskFailure),
}

/// A classified transfer failure
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl TaskFailure {
    pub fn from_error(error: &TransferError) -> Self {
        Self {
            kind: classify(error),
            detail: error.to_string(),
        }
    }

    /// Text stored on the task record
    pub fn message(&self) -> String {
        match self.kind.notice() {
            Some(notice) if self.detail.starts_with(notice) => self.detail.clone(),
            Some(notice) => format!("{}: {}", notice, self.detail),
            None => self.detail.clone(),
        }
    }
}

/// Everything needed to start a run
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: String,
    pub url: String,
    pub path: PathBuf,
    pub snapshot: Option<ResumeSnapshot>,
}

/// Reply to a pause request, sent once nothing more will be written
#[derive(Debug)]
pub(crate) struct PauseAck {
    pub snapshot: Option<ResumeSnapshot>,
    pub bytes_written: u64,
}

pub(crate) type PauseRequest = oneshot::Sender<PauseAck>;

enum Fetched {
    Complete { written: u64, total: Option<u64> },
    Paused,
}

enum Outcome {
    Published,
    Paused,
}

enum Step<T> {
    Done(T),
    Paused(PauseRequest),
}

pub(crate) struct Transfer {
    job: TransferJob,
    run: u64,
    client: Client,
    publisher: Arc<dyn GalleryPublisher>,
    events: mpsc::UnboundedSender<TransferEvent>,
    control: mpsc::Receiver<PauseRequest>,
    policy: RecoveryPolicy,
    progress_interval: Duration,
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: TransferJob,
        run: u64,
        client: Client,
        publisher: Arc<dyn GalleryPublisher>,
        events: mpsc::UnboundedSender<TransferEvent>,
        control: mpsc::Receiver<PauseRequest>,
        policy: RecoveryPolicy,
        progress_interval: Duration,
    ) -> Self {
        Self {
            job,
            run,
            client,
            publisher,
            events,
            control,
            policy,
            progress_interval,
        }
    }

    /// Run to the end. Returns the final event, or None when paused.
    pub(crate) async fn run(mut self) -> Option<TransferEventKind> {
        info!(
            "Task {} run {}: transferring {} to {}",
            self.job.task_id,
            self.run,
            self.job.url,
            self.job.path.display()
        );

        match self.execute().await {
            Ok(Outcome::Published) => {
                info!("Task {} saved to gallery", self.job.task_id);
                Some(TransferEventKind::Succeeded)
            }
            Ok(Outcome::Paused) => None,
            Err(e) => {
                let failure = TaskFailure::from_error(&e);
                if failure.kind == FailureKind::UserCancelled {
                    info!("Task {} stopped: {}", self.job.task_id, e);
                } else {
                    error!("Task {} failed: {}", self.job.task_id, e);
                }
                Some(TransferEventKind::Failed(failure))
            }
        }
    }

    async fn execute(&mut self) -> Result<Outcome, TransferError> {
        let mut pending = self
            .job
            .snapshot
            .take()
            .map(|snapshot| ResumeState::decode(&snapshot, &self.job.url));

        let publisher = self.publisher.clone();
        let permission = match interruptible(&mut self.control, publisher.ensure_permission()).await? {
            Step::Done(result) => result,
            Step::Paused(ack) => {
                // Nothing was touched; hand back what we were given
                let (snapshot, offset) = match &pending {
                    Some(Ok(state)) => (state.encode().ok(), state.offset),
                    _ => (None, 0),
                };
                self.ack_pause(ack, snapshot, offset);
                return Ok(Outcome::Paused);
            }
        };
        permission.map_err(|e| match e {
            PublishError::PermissionDenied(detail) => TransferError::PermissionDenied(detail),
            other => TransferError::PermissionDenied(other.to_string()),
        })?;

        let offset = match &pending {
            Some(Ok(state)) => state.offset,
            _ => 0,
        };
        self.emit(TransferEventKind::Started { offset });

        if let Some(parent) = self.job.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut restarts = 0;
        loop {
            let attempt = match pending.take() {
                None => self.download(None).await,
                Some(Ok(state)) => self.download(Some(state)).await,
                Some(Err(e)) => Err(e),
            };

            match attempt {
                Ok(Fetched::Complete { written, total }) => return self.publish(written, total).await,
                Ok(Fetched::Paused) => return Ok(Outcome::Paused),
                Err(e @ TransferError::ResumeRejected(_)) => match self.policy.decide(&e, restarts) {
                    Decision::RestartFromZero => {
                        restarts += 1;
                        warn!(
                            "Task {}: {}, restarting from zero ({}/{})",
                            self.job.task_id, e, restarts, self.policy.max_restarts
                        );
                        self.emit(TransferEventKind::Restarted);
                    }
                    Decision::Fail => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One HTTP exchange, from byte zero or from a snapshot
    async fn download(&mut self, state: Option<ResumeState>) -> Result<Fetched, TransferError> {
        let url = self.job.url.clone();
        let mut request = self.client.get(&url);

        if let Some(state) = &state {
            let on_disk = match fs::metadata(&self.job.path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            };
            if on_disk < state.offset {
                return Err(TransferError::ResumeRejected(format!(
                    "partial file holds {} of {} bytes",
                    on_disk, state.offset
                )));
            }

            request = request.header(RANGE, format!("bytes={}-", state.offset));
            if let Some(validator) = state.validator() {
                request = request.header(IF_RANGE, validator);
            }
            debug!("Task {}: requesting bytes from {}", self.job.task_id, state.offset);
        }

        let response = match interruptible(&mut self.control, request.send()).await? {
            Step::Done(response) => response,
            Step::Paused(ack) => {
                let (snapshot, offset) = match &state {
                    Some(state) => (state.encode().ok(), state.offset),
                    None => (None, 0),
                };
                self.ack_pause(ack, snapshot, offset);
                return Ok(Fetched::Paused);
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) if state.is_some() => {
                return Err(TransferError::ResumeRejected(format!("resumed request failed: {}", e)));
            }
            Err(e) => return Err(e.into()),
        };
        let status = response.status();

        let (mut file, mut written, total, validators) = match state {
            Some(state) => {
                if status != StatusCode::PARTIAL_CONTENT {
                    return Err(TransferError::ResumeRejected(format!(
                        "server answered {} to a range request",
                        status
                    )));
                }
                let range = ContentRange::from_headers(response.headers())
                    .filter(|range| range.start == state.offset)
                    .ok_or_else(|| {
                        TransferError::ResumeRejected(format!(
                            "content range does not start at byte {}",
                            state.offset
                        ))
                    })?;

                let previous = Validators {
                    etag: state.etag.clone(),
                    last_modified: state.last_modified.clone(),
                };
                let validators = Validators::from_headers(response.headers()).or(previous);
                let total = range.total.or(state.total);

                let mut file = OpenOptions::new().write(true).open(&self.job.path).await?;
                file.set_len(state.offset).await?;
                file.seek(SeekFrom::Start(state.offset)).await?;

                info!("Task {}: resuming at byte {}", self.job.task_id, state.offset);
                (file, state.offset, total, validators)
            }
            None => {
                if !status.is_success() {
                    return Err(TransferError::HttpStatus {
                        status: status.as_u16(),
                    });
                }
                let total = response.content_length();
                let validators = Validators::from_headers(response.headers());
                let file = File::create(&self.job.path).await?;
                (file, 0, total, validators)
            }
        };

        self.emit(TransferEventKind::Progress { written, total });

        let mut stream = response.bytes_stream();
        let mut last_report = Instant::now();

        loop {
            tokio::select! {
                biased;

                request = self.control.recv() => {
                    let Some(ack) = request else {
                        return Err(TransferError::Aborted);
                    };
                    file.flush().await?;
                    file.sync_all().await?;

                    let resume = ResumeState {
                        url: url.clone(),
                        offset: written,
                        total,
                        etag: validators.etag.clone(),
                        last_modified: validators.last_modified.clone(),
                    };
                    self.ack_pause(ack, resume.encode().ok(), written);
                    return Ok(Fetched::Paused);
                }

                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        if self.progress_due(&mut last_report) {
                            self.emit(TransferEventKind::Progress { written, total });
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        self.emit(TransferEventKind::Progress { written, total });

        if let Some(expected) = total {
            if written != expected {
                return Err(TransferError::Incomplete {
                    expected,
                    received: written,
                });
            }
        }

        Ok(Fetched::Complete { written, total })
    }

    async fn publish(&mut self, written: u64, total: Option<u64>) -> Result<Outcome, TransferError> {
        // From here on a pause request gets no answer; only an abort stops the run
        self.control.close();
        while self.control.try_recv().is_ok() {}

        self.emit(TransferEventKind::Saving { written, total });
        info!("Task {}: {} bytes on disk, publishing", self.job.task_id, written);

        self.publisher.publish(&self.job.path).await?;

        if let Err(e) = fs::remove_file(&self.job.path).await {
            warn!(
                "Task {}: could not remove {}: {}",
                self.job.task_id,
                self.job.path.display(),
                e
            );
        }

        Ok(Outcome::Published)
    }

    fn ack_pause(&self, ack: PauseRequest, snapshot: Option<ResumeSnapshot>, bytes_written: u64) {
        info!("Task {} paused at byte {}", self.job.task_id, bytes_written);
        if ack
            .send(PauseAck {
                snapshot,
                bytes_written,
            })
            .is_err()
        {
            debug!("Task {}: pause requester went away", self.job.task_id);
        }
    }

    fn progress_due(&self, last_report: &mut Instant) -> bool {
        if self.progress_interval.is_zero() || last_report.elapsed() >= self.progress_interval {
            *last_report = Instant::now();
            true
        } else {
            false
        }
    }

    fn emit(&self, kind: TransferEventKind) {
        let _ = self.events.send(TransferEvent {
            task_id: self.job.task_id.clone(),
            run: self.run,
            kind,
        });
    }
}

/// Drive `fut` unless a pause request arrives first
async fn interruptible<F: Future>(
    control: &mut mpsc::Receiver<PauseRequest>,
    fut: F,
) -> Result<Step<F::Output>, TransferError> {
    tokio::pin!(fut);

    tokio::select! {
        biased;

        request = control.recv() => match request {
            Some(ack) => Ok(Step::Paused(ack)),
            None => Err(TransferError::Aborted),
        },
        output = &mut fut => Ok(Step::Done(output)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_carries_notice_and_detail() {
        let failure = TaskFailure::from_error(&TransferError::HttpStatus { status: 404 });
        assert_eq!(failure.kind, FailureKind::NetworkFailure);
        assert_eq!(failure.message(), "Download failed: Server responded with 404");

        let failure = TaskFailure::from_error(&TransferError::Publish(PublishError::Rejected(
            "disk full".to_string(),
        )));
        assert_eq!(failure.kind, FailureKind::PublishFailure);
        assert!(failure.message().starts_with("Saving to gallery failed"));

        let failure = TaskFailure::from_error(&TransferError::PermissionDenied(
            "photo library access refused".to_string(),
        ));
        assert_eq!(failure.kind, FailureKind::PermissionDenied);
        assert_eq!(
            failure.message(),
            "Permission denied: photo library access refused"
        );
    }

    #[tokio::test]
    async fn test_interruptible_prefers_pause_request() {
        let (tx, mut rx) = mpsc::channel(1);
        let (ack_tx, _ack_rx) = oneshot::channel();
        tx.send(ack_tx).await.unwrap();

        let step = interruptible(&mut rx, std::future::pending::<()>()).await.unwrap();
        assert!(matches!(step, Step::Paused(_)));
    }

    #[tokio::test]
    async fn test_interruptible_reports_lost_controller() {
        let (tx, mut rx) = mpsc::channel::<PauseRequest>(1);
        drop(tx);

        let result = interruptible(&mut rx, std::future::pending::<()>()).await;
        assert!(matches!(result, Err(TransferError::Aborted)));
    }
}
