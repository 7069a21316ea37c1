//! Orchestrates one open document: local mutations, the save pipeline and
//! the poll loop.
//!
//! Everything runs on one task. Network requests are spawned and report
//! back through a channel tagged with the session epoch; `cancel_all` bumps
//! the epoch, so a response from before a document switch is dropped
//! without effect. Timers are plain deadlines evaluated by [`SyncScheduler::tick`].

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};

use crate::cache::HistoryCache;
use crate::saving::DiskHistoryStore;
use crate::cell::CellRef;
use crate::config::SyncConfig;
use crate::document::{Cursor, Document, DocumentStore};
use crate::error::{DocumentError, HistoryError, SyncError, TransportError};
use crate::history::{Action, ActionKind, HistoryStore, Snapshot, UndoManager};
use crate::persistence::{PersistenceClient, SaveOutcome, TaskHandle};
use crate::reconciler::{ChangeReconciler, PollResult, ReconcileOutcome, Renderer, SelectionTracker, fetch_changes};
use crate::schema::Schema;
use crate::session::{SyncMode, SyncSession};
use crate::transport::{DocumentBackend, SaveResponse};

/// Notifications for whoever drives the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Saved { cursor: Cursor },
    RemoteChange { cursor: Cursor, editor: Option<String> },
    /// Terminal save failure. Must be shown to the user.
    SaveFailed(SyncError),
    Suspended(SyncError),
    Rejected(DocumentError),
    ModeChanged(SyncMode),
}

/// Requests accepted by [`SyncScheduler::run`].
#[derive(Debug)]
pub enum Command {
    Edit { cell: CellRef, value: String },
    AppendRows(usize),
    DeleteRows(Range<usize>),
    SetSchema(Schema),
    Undo,
    Redo,
    RetrySave,
    Open { document_id: String },
    Close,
}

/// Where recent undo history of each opened document is kept.
#[derive(Clone)]
pub enum HistorySource {
    /// Shared in-process LRU cache, lost on exit.
    Cache(HistoryCache),
    /// One compressed file per document under a directory.
    Disk(PathBuf),
}

impl HistorySource {
    fn open(&self) -> Box<dyn HistoryStore> {
        match self {
            HistorySource::Cache(cache) => Box::new(cache.clone()),
            HistorySource::Disk(dir) => Box::new(DiskHistoryStore::new(dir.clone())),
        }
    }
}

enum Completion {
    Save {
        epoch: u64,
        attempt: u32,
        revision: u64,
        result: Result<SaveResponse, TransportError>,
    },
    Poll {
        epoch: u64,
        result: Result<PollResult, TransportError>,
    },
}

pub struct SyncScheduler {
    config: SyncConfig,
    backend: Arc<dyn DocumentBackend>,
    session: SyncSession,
    store: DocumentStore,
    history: UndoManager,
    history_source: Option<HistorySource>,
    persistence: PersistenceClient,
    reconciler: ChangeReconciler,
    next_poll: Option<Instant>,
    epoch: u64,
    save_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl SyncScheduler {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn DocumentBackend>,
        document_id: impl Into<String>,
        document: Document,
        cursor: Cursor,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let document_id = document_id.into();
        let mut scheduler = SyncScheduler {
            persistence: PersistenceClient::new(&config),
            reconciler: ChangeReconciler::new(config.poll_timeout),
            history: UndoManager::new(config.history_limit),
            history_source: None,
            session: SyncSession::new(document_id.clone()),
            store: DocumentStore::new(Document::default(), Cursor::default()),
            next_poll: None,
            epoch: 0,
            save_task: None,
            poll_task: None,
            completions_tx,
            completions_rx,
            events: None,
            config,
            backend,
        };
        scheduler.open_document(document_id, document, cursor);
        scheduler
    }

    /// Fetches `document_id` from the backend and opens it.
    pub async fn connect(
        config: SyncConfig,
        backend: Arc<dyn DocumentBackend>,
        document_id: &str,
    ) -> Result<Self, SyncError> {
        let opened = backend
            .open(document_id)
            .await
            .map_err(|e| SyncError::from_final(document_id, e))?;
        Ok(Self::new(config, backend, document_id, opened.document, opened.cursor))
    }

    /// Keeps each document's recent history in `source`, restoring it when
    /// the document is opened again.
    pub fn with_history(mut self, source: HistorySource) -> Self {
        self.history_source = Some(source);
        self.history = self.new_history();
        self
    }

    fn new_history(&self) -> UndoManager {
        let history = UndoManager::new(self.config.history_limit);
        match &self.history_source {
            Some(source) => history.with_store(
                self.session.document_id.clone(),
                source.open(),
                self.config.history_cache_entries,
            ),
            None => history,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn set_renderer(&mut self, renderer: Box<dyn Renderer>) {
        self.reconciler.set_renderer(renderer);
    }

    pub fn set_selection_tracker(&mut self, selection: Box<dyn SelectionTracker>) {
        self.reconciler.set_selection_tracker(selection);
    }

    pub fn document(&self) -> &Document {
        self.store.document()
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn history(&self) -> &UndoManager {
        &self.history
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn cursor(&self) -> Cursor {
        self.store.cursor()
    }

    pub fn mode(&self) -> SyncMode {
        self.session.mode
    }

    /// Tears down the current document and starts syncing `document_id`.
    pub fn open_document(&mut self, document_id: impl Into<String>, document: Document, cursor: Cursor) {
        self.cancel_all();
        self.session = SyncSession::new(document_id);
        self.store = DocumentStore::new(document, cursor);
        self.history = self.new_history();
        self.next_poll = Some(Instant::now() + self.config.slow_poll_interval);
        log::info!("opened {} at cursor {}", self.session.document_id, cursor);
    }

    /// Cancels the debounce/retry timer, abandons in-flight requests and
    /// resets the session. Responses still on their way become no-ops. A
    /// suspended session stays suspended until `open_document`.
    pub fn cancel_all(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.save_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.persistence.cancel_all();
        self.next_poll = None;
        self.session.reset();
        log::debug!("sync for {} cancelled (epoch {})", self.session.document_id, self.epoch);
    }

    pub fn apply_local_edit(&mut self, cell: CellRef, value: impl Into<String>) -> Result<(), DocumentError> {
        let value = value.into();
        self.store.check_cell(cell)?;
        if self.store.document().get(cell) == Some(value.as_str()) {
            return Ok(());
        }
        self.mutate(Action::edit(cell), |store| store.apply_local_edit(cell, value))
    }

    /// Appends `count` empty rows and returns the index of the first one.
    pub fn append_rows(&mut self, count: usize) -> usize {
        if count == 0 {
            return self.store.document().row_count();
        }
        let before = Snapshot::capture(
            &self.store,
            Action::new(ActionKind::AppendRows, format!("Add {} row(s)", count)),
        );
        let first = self.store.append_rows(count);
        self.commit(before);
        first
    }

    pub fn delete_rows(&mut self, range: Range<usize>) -> Result<(), DocumentError> {
        let action = Action::new(
            ActionKind::DeleteRows,
            format!("Delete rows {}-{}", range.start + 1, range.end),
        );
        self.mutate(action, |store| store.delete_rows(range))
    }

    pub fn set_schema(&mut self, schema: Schema) {
        if schema == *self.store.document().schema() {
            return;
        }
        let before = Snapshot::capture(&self.store, Action::new(ActionKind::SchemaChange, "Change columns"));
        self.store.set_schema(schema);
        self.commit(before);
    }

    /// Records the pre-mutation snapshot, applies `apply`, then schedules a
    /// save. Nothing is recorded if `apply` fails.
    pub fn mutate<F>(&mut self, action: Action, apply: F) -> Result<(), DocumentError>
    where
        F: FnOnce(&mut DocumentStore) -> Result<(), DocumentError>,
    {
        let before = Snapshot::capture(&self.store, action);
        apply(&mut self.store)?;
        self.commit(before);
        Ok(())
    }

    /// Pushes the pre-mutation snapshot and schedules a save.
    fn commit(&mut self, before: Snapshot) {
        self.history.push_snapshot(before);
        self.schedule_save();
    }

    pub fn undo(&mut self) -> Result<Action, HistoryError> {
        let action = self.history.undo(&mut self.store)?;
        self.schedule_save();
        Ok(action)
    }

    pub fn redo(&mut self) -> Result<Action, HistoryError> {
        let action = self.history.redo(&mut self.store)?;
        self.schedule_save();
        Ok(action)
    }

    /// Arms the debounce timer. Returns `None` while sync is suspended.
    pub fn schedule_save(&mut self) -> Option<TaskHandle> {
        if self.session.suspended {
            return None;
        }
        Some(self.persistence.schedule_save(Instant::now()))
    }

    pub fn cancel_save(&mut self, handle: TaskHandle) -> bool {
        self.persistence.cancel(handle)
    }

    /// Resends unsaved edits after a terminal failure.
    pub fn retry_save(&mut self) {
        if self.store.is_dirty() && !self.session.in_flight_save {
            self.persistence.cancel_all();
            self.start_save(1);
        }
    }

    /// Saves immediately and waits for the outcome, retries included.
    pub async fn flush(&mut self) -> Result<Cursor, SyncError> {
        while self.session.in_flight_save {
            self.tick().await;
        }
        if !self.store.is_dirty() {
            return Ok(self.store.cursor());
        }
        let result = self
            .persistence
            .attempt_save(self.backend.as_ref(), &mut self.session, &mut self.store, 1)
            .await;
        match &result {
            Ok(cursor) => self.after_saved(*cursor, Instant::now()),
            Err(err) => self.after_save_failed(err.clone()),
        }
        result
    }

    /// Polls right away and waits for the answer.
    pub async fn poll_once(&mut self) -> Result<ReconcileOutcome, SyncError> {
        while self.session.in_flight_poll {
            self.tick().await;
        }
        let result = self
            .reconciler
            .poll_once(self.backend.clone(), &mut self.session, &mut self.store, &mut self.history)
            .await;
        let now = Instant::now();
        match &result {
            Ok(outcome) => self.after_reconcile(outcome, now),
            Err(SyncError::Transport(err)) if !err.is_retryable() => {
                self.after_poll_failed(err.clone())
            }
            Err(_) => {}
        }
        if !self.session.suspended {
            self.next_poll = Some(now + self.poll_interval());
        }
        result
    }

    /// Waits for the next due timer or request completion and handles it.
    pub async fn tick(&mut self) {
        let deadline = self.next_deadline();
        tokio::select! {
            Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
            _ = sleep_until_opt(deadline) => self.on_timers(Instant::now()),
        }
    }

    /// Drives the session until `Close` arrives or every sender is gone.
    /// Unsaved edits are flushed before returning.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = self.tick() => {}
            }
        }
        if self.store.is_dirty() && !self.session.suspended {
            if let Err(e) = self.flush().await {
                log::warn!("closing {} with unsaved edits: {}", self.session.document_id, e);
            }
        }
        self.cancel_all();
    }

    async fn handle_command(&mut self, command: Command) {
        let rejected = match command {
            Command::Edit { cell, value } => self.apply_local_edit(cell, value).err(),
            Command::AppendRows(count) => {
                self.append_rows(count);
                None
            }
            Command::DeleteRows(range) => self.delete_rows(range).err(),
            Command::SetSchema(schema) => {
                self.set_schema(schema);
                None
            }
            Command::Undo => {
                let _ = self.undo();
                None
            }
            Command::Redo => {
                let _ = self.redo();
                None
            }
            Command::RetrySave => {
                self.retry_save();
                None
            }
            Command::Open { document_id } => {
                match self.backend.open(&document_id).await {
                    Ok(opened) => self.open_document(document_id, opened.document, opened.cursor),
                    Err(err) => self.emit(SyncEvent::Suspended(SyncError::from_final(&document_id, err))),
                }
                None
            }
            Command::Close => None,
        };
        if let Some(err) = rejected {
            self.emit(SyncEvent::Rejected(err));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.persistence.next_due(), self.next_poll, self.session.fast_until]
            .into_iter()
            .flatten()
            .min()
    }

    fn poll_interval(&self) -> Duration {
        match self.session.mode {
            SyncMode::Fast => self.config.fast_poll_interval,
            SyncMode::Slow => self.config.slow_poll_interval,
        }
    }

    fn on_timers(&mut self, now: Instant) {
        if self.session.decay(now) {
            log::debug!("{} back to slow sync", self.session.document_id);
            self.emit(SyncEvent::ModeChanged(SyncMode::Slow));
        }
        if let Some(attempt) = self.persistence.take_due(now) {
            self.start_save(attempt);
        }
        if self.next_poll.is_some_and(|at| at <= now) {
            self.next_poll = None;
            self.start_poll();
        }
    }

    fn start_save(&mut self, attempt: u32) {
        if self.session.suspended {
            return;
        }
        if attempt == 1 && (self.session.in_flight_save || !self.store.is_dirty()) {
            // a save in flight is followed by another one if edits remain
            return;
        }
        self.session.in_flight_save = true;
        let request = self.persistence.begin(&self.session.document_id, &self.store);
        let revision = self.store.revision();
        let backend = self.backend.clone();
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        log::debug!("saving {} (attempt {}, revision {})", self.session.document_id, attempt, revision);
        self.save_task = Some(tokio::spawn(async move {
            let result = backend.save(request).await;
            let _ = tx.send(Completion::Save {
                epoch,
                attempt,
                revision,
                result,
            });
        }));
    }

    /// Issues a poll unless one is already outstanding. A poll is sent even
    /// while a save is in flight; its result is then discarded.
    pub fn start_poll(&mut self) -> bool {
        if self.session.suspended || self.session.in_flight_poll {
            return false;
        }
        self.session.in_flight_poll = true;
        self.next_poll = None;
        let backend = self.backend.clone();
        let document_id = self.session.document_id.clone();
        let since = self.store.cursor();
        let limit = self.reconciler.timeout();
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        self.poll_task = Some(tokio::spawn(async move {
            let result = fetch_changes(backend, document_id, since, limit).await;
            let _ = tx.send(Completion::Poll { epoch, result });
        }));
        true
    }

    fn on_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        match completion {
            Completion::Save { epoch, .. } | Completion::Poll { epoch, .. } if epoch != self.epoch => {
                log::debug!("dropping response from cancelled epoch {}", epoch);
            }
            Completion::Save {
                attempt,
                revision,
                result,
                ..
            } => {
                self.save_task = None;
                match self.persistence.complete(&self.session.document_id, attempt, result) {
                    SaveOutcome::Saved(cursor) => {
                        self.store.mark_saved(revision);
                        self.after_saved(cursor, now);
                    }
                    SaveOutcome::Retry { attempt, delay } => {
                        log::warn!(
                            "save of {} failed, retry {} in {:?}",
                            self.session.document_id,
                            attempt,
                            delay
                        );
                        self.persistence.schedule_retry(attempt, now + delay);
                    }
                    SaveOutcome::Failed(err) => {
                        self.session.in_flight_save = false;
                        self.after_save_failed(err);
                    }
                }
            }
            Completion::Poll { result, .. } => {
                self.poll_task = None;
                self.session.in_flight_poll = false;
                match result {
                    Ok(result) => {
                        match self
                            .reconciler
                            .reconcile(result, &self.session, &mut self.store, &mut self.history)
                        {
                            Ok(outcome) => self.after_reconcile(&outcome, now),
                            Err(err) => log::warn!("ignoring malformed remote document: {}", err),
                        }
                    }
                    Err(err) if err.is_retryable() => {
                        log::debug!("poll of {} failed, next tick retries: {}", self.session.document_id, err);
                    }
                    Err(err) => self.after_poll_failed(err),
                }
                if !self.session.suspended {
                    self.next_poll = Some(now + self.poll_interval());
                }
            }
        }
    }

    fn after_saved(&mut self, cursor: Cursor, now: Instant) {
        let cursor = self.store.advance_cursor(cursor);
        self.session.in_flight_save = false;
        log::info!("saved {} at cursor {}", self.session.document_id, cursor);
        self.emit(SyncEvent::Saved { cursor });
        self.enter_fast_mode(now);
        if self.store.is_dirty() {
            self.schedule_save();
        }
    }

    fn after_save_failed(&mut self, err: SyncError) {
        log::error!("saving {} failed: {}", self.session.document_id, err);
        if err.suspends_sync() {
            self.suspend(err);
        } else {
            self.emit(SyncEvent::SaveFailed(err));
        }
    }

    fn after_reconcile(&mut self, outcome: &ReconcileOutcome, now: Instant) {
        if let ReconcileOutcome::Applied { cursor, editor } = outcome {
            self.emit(SyncEvent::RemoteChange {
                cursor: *cursor,
                editor: editor.clone(),
            });
            self.enter_fast_mode(now);
        }
    }

    fn after_poll_failed(&mut self, err: TransportError) {
        let err = SyncError::from_final(&self.session.document_id, err);
        if err.suspends_sync() {
            self.suspend(err);
        } else {
            log::warn!("poll of {} failed: {}", self.session.document_id, err);
        }
    }

    /// Stops all sync for the current document until it is reopened.
    fn suspend(&mut self, err: SyncError) {
        log::error!("suspending sync for {}: {}", self.session.document_id, err);
        self.session.suspended = true;
        self.persistence.cancel_all();
        self.next_poll = None;
        self.emit(SyncEvent::Suspended(err));
    }

    fn enter_fast_mode(&mut self, now: Instant) {
        if self.session.enter_fast_mode(now, self.config.fast_mode_window) {
            log::debug!("{} in fast sync", self.session.document_id);
            self.emit(SyncEvent::ModeChanged(SyncMode::Fast));
        }
        let soon = now + self.config.fast_poll_interval;
        if !self.session.in_flight_poll && !self.session.suspended {
            self.next_poll = Some(self.next_poll.map_or(soon, |at| at.min(soon)));
        }
    }

    fn emit(&mut self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                self.events = None;
            }
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.save_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
