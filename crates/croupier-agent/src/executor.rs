// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job executor: asynchronous function invocations with progress events.
//!
//! A job runs on its own task and reports staged progress: 0 on admission,
//! 20 before the local call, 90 after it, then the terminal event. Terminal
//! outcomes stay queryable for ten minutes; an idempotency key presented
//! within the same window replays the original job id without re-executing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use croupier_proto::function::{InvokeRequest, JobEvent, JobEventType, JobState};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::LocalDispatch;

/// Idempotency keys replay the original job id within this window.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

/// How long a terminal result stays queryable.
const TERMINAL_TTL: Duration = Duration::from_secs(600);

/// Buffered events per subscriber, non-blocking delivery.
const JOB_EVENT_BUFFER: usize = 16;

struct ActiveJob {
    cancel: Option<oneshot::Sender<String>>,
    subscribers: Vec<mpsc::Sender<JobEvent>>,
}

struct TerminalJob {
    state: JobState,
    payload: Vec<u8>,
    error: String,
    stored_at: Instant,
}

struct IdemEntry {
    job_id: String,
    stored_at: Instant,
}

/// A job's queryable status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub state: JobState,
    pub payload: Vec<u8>,
    pub error: String,
}

/// Runs jobs against the local dispatch seam. Cheap to clone; clones share
/// the same job tables.
pub struct JobExecutor<D: LocalDispatch> {
    inner: Arc<Inner<D>>,
}

impl<D: LocalDispatch> Clone for JobExecutor<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<D: LocalDispatch> {
    dispatch: Arc<D>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    terminal: Mutex<HashMap<String, TerminalJob>>,
    idempotency: Mutex<HashMap<String, IdemEntry>>,
}

impl<D: LocalDispatch> JobExecutor<D> {
    pub fn new(dispatch: Arc<D>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatch,
                jobs: Mutex::new(HashMap::new()),
                terminal: Mutex::new(HashMap::new()),
                idempotency: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a job, or replay the id of the job an idempotency key already
    /// maps to. The returned receiver carries this job's events from the
    /// start; it is `None` on an idempotent replay of a finished job.
    pub fn start_job(&self, request: &InvokeRequest) -> (String, Option<mpsc::Receiver<JobEvent>>) {
        if !request.idempotency_key.is_empty() {
            let mut idem = self
                .inner
                .idempotency
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            idem.retain(|_, entry| entry.stored_at.elapsed() < IDEMPOTENCY_WINDOW);
            if let Some(entry) = idem.get(&request.idempotency_key) {
                let job_id = entry.job_id.clone();
                drop(idem);
                debug!(job_id = %job_id, key = %request.idempotency_key, "idempotent replay");
                return (job_id.clone(), self.subscribe(&job_id));
            }
        }

        let job_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(JOB_EVENT_BUFFER);
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                job_id.clone(),
                ActiveJob {
                    cancel: Some(cancel_tx),
                    subscribers: vec![events_tx],
                },
            );
        if !request.idempotency_key.is_empty() {
            self.inner
                .idempotency
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    request.idempotency_key.clone(),
                    IdemEntry {
                        job_id: job_id.clone(),
                        stored_at: Instant::now(),
                    },
                );
        }
        info!(job_id = %job_id, function_id = %request.function_id, "job started");

        let inner = self.inner.clone();
        let request = request.clone();
        let task_job_id = job_id.clone();
        tokio::spawn(async move {
            inner.run(task_job_id, request, cancel_rx).await;
        });
        (job_id, Some(events_rx))
    }

    /// Subscribe to a running job's remaining events. `None` when the job
    /// is not active; finished jobs answer through `snapshot`.
    pub fn subscribe(&self, job_id: &str) -> Option<mpsc::Receiver<JobEvent>> {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(job_id)?;
        let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
        job.subscribers.push(tx);
        Some(rx)
    }

    /// Best-effort cancellation. True when a cancel signal was delivered.
    pub fn cancel(&self, job_id: &str, reason: &str) -> bool {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(job_id).and_then(|job| job.cancel.take()) {
            Some(cancel_tx) => {
                let reason = if reason.is_empty() {
                    "job cancelled".to_string()
                } else {
                    reason.to_string()
                };
                cancel_tx.send(reason).is_ok()
            }
            None => false,
        }
    }

    /// Current status: `Running` while active, the cached outcome for ten
    /// minutes after the terminal event, `Unknown` otherwise.
    pub fn snapshot(&self, job_id: &str) -> JobSnapshot {
        if self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
        {
            return JobSnapshot {
                state: JobState::Running,
                payload: Vec::new(),
                error: String::new(),
            };
        }
        let mut terminal = self.inner.terminal.lock().unwrap_or_else(|e| e.into_inner());
        terminal.retain(|_, entry| entry.stored_at.elapsed() < TERMINAL_TTL);
        match terminal.get(job_id) {
            Some(entry) => JobSnapshot {
                state: entry.state,
                payload: entry.payload.clone(),
                error: entry.error.clone(),
            },
            None => JobSnapshot {
                state: JobState::Unknown,
                payload: Vec::new(),
                error: String::new(),
            },
        }
    }
}

impl<D: LocalDispatch> Inner<D> {
    async fn run(
        self: Arc<Self>,
        job_id: String,
        request: InvokeRequest,
        mut cancel_rx: oneshot::Receiver<String>,
    ) {
        self.emit(&job_id, progress(0));
        self.emit(&job_id, progress(20));

        let outcome = tokio::select! {
            result = self.dispatch.invoke(
                &request.function_id,
                &request.payload,
                &request.metadata,
            ) => result,
            reason = &mut cancel_rx => {
                let reason = reason.unwrap_or_else(|_| "job cancelled".to_string());
                self.finish(
                    &job_id,
                    JobState::Cancelled,
                    Vec::new(),
                    format!("cancelled: {}", reason),
                );
                return;
            }
        };

        match outcome {
            Ok(payload) => {
                self.emit(&job_id, progress(90));
                self.finish(&job_id, JobState::Done, payload, String::new());
            }
            Err(err) => {
                self.finish(&job_id, JobState::Error, Vec::new(), err.to_string());
            }
        }
    }

    fn emit(&self, job_id: &str, event: JobEvent) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(job_id) {
            job.subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                // full: this subscriber misses the event but stays
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Record the terminal outcome, deliver the terminal event, and close
    /// every subscriber.
    fn finish(&self, job_id: &str, state: JobState, payload: Vec<u8>, error: String) {
        let event = JobEvent {
            r#type: match state {
                JobState::Done => JobEventType::Done as i32,
                _ => JobEventType::Error as i32,
            },
            progress: 100,
            message: error.clone(),
            payload: payload.clone(),
        };
        {
            let mut terminal = self.terminal.lock().unwrap_or_else(|e| e.into_inner());
            terminal.retain(|_, entry| entry.stored_at.elapsed() < TERMINAL_TTL);
            terminal.insert(
                job_id.to_string(),
                TerminalJob {
                    state,
                    payload,
                    error,
                    stored_at: Instant::now(),
                },
            );
        }
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        for tx in job.into_iter().flat_map(|j| j.subscribers) {
            match tx.try_send(event.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                // a full buffer drops intermediates, never the terminal
                // event; park a sender until the subscriber drains
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tokio::spawn(async move {
                        let _ = tx.send(event).await;
                    });
                }
            }
        }
        info!(job_id = %job_id, state = ?state, "job finished");
    }
}

fn progress(progress: i32) -> JobEvent {
    JobEvent {
        r#type: JobEventType::Progress as i32,
        progress,
        message: String::new(),
        payload: Vec::new(),
    }
}
