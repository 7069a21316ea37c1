//! Save pipeline: debounce, whole-document save, linear backoff.

use tokio::time::{Duration, Instant, sleep_until};

use crate::config::SyncConfig;
use crate::document::{Cursor, DocumentStore};
use crate::error::{SyncError, TransportError};
use crate::session::SyncSession;
use crate::transport::{DocumentBackend, SaveRequest, SaveResponse};

/// Identifies one scheduled save timer. Stale handles cancel nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

#[derive(Clone, Copy, Debug)]
struct Timer {
    handle: TaskHandle,
    due: Instant,
    attempt: u32,
}

/// What to do after a save request came back.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Cursor),
    Retry { attempt: u32, delay: Duration },
    Failed(SyncError),
}

/// Owns the single save timer of a document (debounce or retry backoff)
/// and decides what each save result means.
#[derive(Debug)]
pub struct PersistenceClient {
    debounce: Duration,
    max_retries: u32,
    base_delay: Duration,
    timer: Option<Timer>,
    next_id: u64,
}

impl PersistenceClient {
    pub fn new(config: &SyncConfig) -> Self {
        PersistenceClient {
            debounce: config.debounce,
            max_retries: config.max_retries.max(1),
            base_delay: config.retry_base_delay,
            timer: None,
            next_id: 0,
        }
    }

    /// Arms (or re-arms) the debounce timer. A pending retry is left alone:
    /// the retry sends the latest document anyway.
    pub fn schedule_save(&mut self, now: Instant) -> TaskHandle {
        if let Some(timer) = self.timer.filter(|t| t.attempt > 1) {
            return timer.handle;
        }
        self.arm(now + self.debounce, 1)
    }

    pub fn schedule_retry(&mut self, attempt: u32, due: Instant) -> TaskHandle {
        self.arm(due, attempt)
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        if self.timer.is_some_and(|t| t.handle == handle) {
            self.timer = None;
            return true;
        }
        false
    }

    pub fn cancel_all(&mut self) {
        self.timer = None;
    }

    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.timer.is_some_and(|t| t.handle == handle)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.timer.map(|t| t.due)
    }

    /// Disarms and returns the attempt number of a timer that is due.
    pub fn take_due(&mut self, now: Instant) -> Option<u32> {
        match self.timer {
            Some(timer) if timer.due <= now => {
                self.timer = None;
                Some(timer.attempt)
            }
            _ => None,
        }
    }

    /// Serialises the full document; the protocol has no diffs.
    pub fn begin(&self, document_id: &str, store: &DocumentStore) -> SaveRequest {
        SaveRequest::new(document_id, store.document())
    }

    pub fn complete(
        &self,
        document_id: &str,
        attempt: u32,
        result: Result<SaveResponse, TransportError>,
    ) -> SaveOutcome {
        match result {
            Ok(response) => SaveOutcome::Saved(response.timestamp),
            Err(err) if err.is_retryable() && attempt < self.max_retries => SaveOutcome::Retry {
                attempt: attempt + 1,
                delay: self.base_delay * attempt,
            },
            Err(err) => match err.status() {
                Some(401 | 403 | 404) => SaveOutcome::Failed(SyncError::from_final(document_id, err)),
                _ => SaveOutcome::Failed(SyncError::SaveFailed {
                    attempts: attempt,
                    source: err,
                }),
            },
        }
    }

    /// Runs a save to completion, retries included, without going through
    /// the scheduler. Any pending timer is superseded.
    pub async fn attempt_save(
        &mut self,
        backend: &dyn DocumentBackend,
        session: &mut SyncSession,
        store: &mut DocumentStore,
        mut attempt: u32,
    ) -> Result<Cursor, SyncError> {
        if session.suspended {
            return Err(SyncError::Suspended(session.document_id.clone()));
        }
        self.cancel_all();
        session.in_flight_save = true;
        loop {
            let request = self.begin(&session.document_id, store);
            let revision = store.revision();
            let result = backend.save(request).await;
            match self.complete(&session.document_id, attempt, result) {
                SaveOutcome::Saved(cursor) => {
                    store.advance_cursor(cursor);
                    store.mark_saved(revision);
                    session.in_flight_save = false;
                    return Ok(store.cursor());
                }
                SaveOutcome::Retry { attempt: next, delay } => {
                    log::debug!("save of {} failed, retry {} in {:?}", session.document_id, next, delay);
                    sleep_until(Instant::now() + delay).await;
                    attempt = next;
                }
                SaveOutcome::Failed(err) => {
                    session.in_flight_save = false;
                    return Err(err);
                }
            }
        }
    }

    fn arm(&mut self, due: Instant, attempt: u32) -> TaskHandle {
        self.next_id += 1;
        let handle = TaskHandle(self.next_id);
        self.timer = Some(Timer { handle, due, attempt });
        handle
    }
}
