//! Applies server state polled from the backend.
//!
//! Reconciliation is document-level last-writer-wins: a newer server copy
//! replaces the local document wholesale. Two editors changing different
//! cells inside one poll window can therefore lose one of the edits; there
//! is no per-cell conflict detection.

use std::sync::Arc;
use tokio::time::{Duration, timeout};

use crate::cell::CellRef;
use crate::document::{Cursor, Document, DocumentStore};
use crate::error::{DocumentError, SyncError, TransportError};
use crate::history::UndoManager;
use crate::session::SyncSession;
use crate::transport::{ChangesResponse, DocumentBackend};

/// Redraws the table after a merge.
pub trait Renderer: Send {
    fn render(&mut self, document: &Document);
}

/// Externally tracked cursor/selection position.
pub trait SelectionTracker: Send {
    fn position(&self) -> Option<CellRef>;

    /// Called after a merge with the old position, or `None` if that cell
    /// no longer exists.
    fn reattach(&mut self, position: Option<CellRef>);
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet {
    pub document: Document,
    pub cursor: Cursor,
    pub editor: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollResult {
    NoChange,
    Changes(ChangeSet),
}

impl TryFrom<ChangesResponse> for PollResult {
    type Error = TransportError;

    fn try_from(response: ChangesResponse) -> Result<Self, Self::Error> {
        if !response.has_changes {
            return Ok(PollResult::NoChange);
        }
        match (response.data, response.last_edit_time) {
            (Some(document), Some(cursor)) => Ok(PollResult::Changes(ChangeSet {
                document,
                cursor,
                editor: response.last_editor,
            })),
            _ => Err(TransportError::Decode(
                "has_changes without data or last_edit_time".into(),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// A save was in flight when the response arrived.
    SaveInFlight,
    /// The server copy is older than what this client already has.
    Stale,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    NoChange,
    Applied { cursor: Cursor, editor: Option<String> },
    Discarded(DiscardReason),
}

/// Issues one bounded "changes since" request.
pub async fn fetch_changes(
    backend: Arc<dyn DocumentBackend>,
    document_id: String,
    since: Cursor,
    limit: Duration,
) -> Result<PollResult, TransportError> {
    let response = timeout(limit, backend.fetch_changes(&document_id, since))
        .await
        .map_err(|_| TransportError::Timeout)??;
    PollResult::try_from(response)
}

pub struct ChangeReconciler {
    timeout: Duration,
    renderer: Option<Box<dyn Renderer>>,
    selection: Option<Box<dyn SelectionTracker>>,
}

impl ChangeReconciler {
    pub fn new(timeout: Duration) -> Self {
        ChangeReconciler {
            timeout,
            renderer: None,
            selection: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_renderer(&mut self, renderer: Box<dyn Renderer>) {
        self.renderer = Some(renderer);
    }

    pub fn set_selection_tracker(&mut self, selection: Box<dyn SelectionTracker>) {
        self.selection = Some(selection);
    }

    /// Applies a poll result. The in-flight-save guard is read here, when
    /// the response is in hand, not when the poll was issued.
    pub fn reconcile(
        &mut self,
        result: PollResult,
        session: &SyncSession,
        store: &mut DocumentStore,
        history: &mut UndoManager,
    ) -> Result<ReconcileOutcome, DocumentError> {
        let changes = match result {
            PollResult::NoChange => return Ok(ReconcileOutcome::NoChange),
            PollResult::Changes(changes) => changes,
        };
        if session.in_flight_save {
            log::debug!("discarding poll result for {}: save in flight", session.document_id);
            return Ok(ReconcileOutcome::Discarded(DiscardReason::SaveInFlight));
        }
        if changes.cursor == store.cursor() {
            log::debug!(
                "poll result for {} is already known at cursor {}",
                session.document_id,
                changes.cursor
            );
            return Ok(ReconcileOutcome::NoChange);
        }
        if changes.cursor < store.cursor() {
            log::debug!(
                "discarding poll result for {}: cursor {} older than {}",
                session.document_id,
                changes.cursor,
                store.cursor()
            );
            return Ok(ReconcileOutcome::Discarded(DiscardReason::Stale));
        }

        let position = self.selection.as_ref().and_then(|s| s.position());
        store.replace_with_remote(changes.document, changes.cursor)?;
        history.reset_redo();

        if let Some(selection) = self.selection.as_mut() {
            selection.reattach(position.filter(|cell| store.document().contains(*cell)));
        }
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.render(store.document());
        }
        log::info!(
            "applied remote change to {} at cursor {} (editor: {})",
            session.document_id,
            changes.cursor,
            changes.editor.as_deref().unwrap_or("unknown")
        );
        Ok(ReconcileOutcome::Applied {
            cursor: changes.cursor,
            editor: changes.editor,
        })
    }

    /// Polls once and reconciles the answer.
    pub async fn poll_once(
        &mut self,
        backend: Arc<dyn DocumentBackend>,
        session: &mut SyncSession,
        store: &mut DocumentStore,
        history: &mut UndoManager,
    ) -> Result<ReconcileOutcome, SyncError> {
        if session.suspended {
            return Err(SyncError::Suspended(session.document_id.clone()));
        }
        session.in_flight_poll = true;
        let result = fetch_changes(backend, session.document_id.clone(), store.cursor(), self.timeout).await;
        session.in_flight_poll = false;
        Ok(self.reconcile(result?, session, store, history)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Action;
    use crate::schema::Schema;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        reattached: Arc<Mutex<Vec<Option<CellRef>>>>,
        rendered: Arc<Mutex<usize>>,
        position: Option<CellRef>,
    }

    impl SelectionTracker for Recorder {
        fn position(&self) -> Option<CellRef> {
            self.position
        }

        fn reattach(&mut self, position: Option<CellRef>) {
            self.reattached.lock().unwrap().push(position);
        }
    }

    impl Renderer for Recorder {
        fn render(&mut self, _: &Document) {
            *self.rendered.lock().unwrap() += 1;
        }
    }

    fn schema() -> Schema {
        Schema::from_tags(&["email", "secret"])
    }

    fn remote(rows: usize, cursor: i64) -> PollResult {
        let rows = (0..rows).map(|i| vec![format!("u{}@x.com", i), String::new()]).collect();
        PollResult::Changes(ChangeSet {
            document: Document::from_rows(schema(), rows).unwrap(),
            cursor: Cursor(cursor),
            editor: Some("bob".into()),
        })
    }

    fn local() -> (SyncSession, DocumentStore, UndoManager) {
        let mut store = DocumentStore::new(Document::new(schema()), Cursor(100));
        store.append_rows(3);
        (SyncSession::new("doc"), store, UndoManager::default())
    }

    #[test]
    fn remote_change_replaces_document_and_clears_redo() {
        let (session, mut store, mut history) = local();
        history.push_undo(&store, Action::edit(CellRef::new(0, 0)));
        store.apply_local_edit(CellRef::new(0, 0), "mine").unwrap();
        history.undo(&mut store).unwrap();
        assert!(history.can_redo());

        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        let outcome = reconciler
            .reconcile(remote(2, 101), &session, &mut store, &mut history)
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                cursor: Cursor(101),
                editor: Some("bob".into())
            }
        );
        assert_eq!(store.document().get(CellRef::new(1, 0)), Some("u1@x.com"));
        assert_eq!(store.cursor(), Cursor(101));
        assert!(!history.can_redo());
        assert!(history.can_undo());
    }

    #[test]
    fn save_in_flight_discards_the_result() {
        let (mut session, mut store, mut history) = local();
        session.in_flight_save = true;
        let before = store.snapshot();
        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        let outcome = reconciler
            .reconcile(remote(1, 150), &session, &mut store, &mut history)
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Discarded(DiscardReason::SaveInFlight));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.cursor(), Cursor(100));
    }

    #[test]
    fn older_server_copy_never_rewinds_the_cursor() {
        let (session, mut store, mut history) = local();
        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        let outcome = reconciler
            .reconcile(remote(1, 99), &session, &mut store, &mut history)
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Discarded(DiscardReason::Stale));
        assert_eq!(store.cursor(), Cursor(100));
    }

    #[test]
    fn echo_of_the_local_cursor_keeps_pending_edits() {
        let (session, mut store, mut history) = local();
        store.apply_local_edit(CellRef::new(0, 0), "pending@x.com").unwrap();
        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        let outcome = reconciler
            .reconcile(remote(3, 100), &session, &mut store, &mut history)
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoChange);
        assert_eq!(store.document().get(CellRef::new(0, 0)), Some("pending@x.com"));
        assert!(store.is_dirty());
    }

    #[test]
    fn applying_the_same_change_twice_is_idempotent() {
        let (session, mut store, mut history) = local();
        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        reconciler
            .reconcile(remote(2, 101), &session, &mut store, &mut history)
            .unwrap();
        let once = (store.snapshot(), store.cursor());
        let again = reconciler
            .reconcile(remote(2, 101), &session, &mut store, &mut history)
            .unwrap();
        assert_eq!(again, ReconcileOutcome::NoChange);
        assert_eq!((store.snapshot(), store.cursor()), once);
    }

    #[test]
    fn selection_is_reattached_or_dropped() {
        let (session, mut store, mut history) = local();
        let recorder = Recorder {
            position: Some(CellRef::new(2, 1)),
            ..Recorder::default()
        };
        let mut reconciler = ChangeReconciler::new(Duration::from_secs(1));
        reconciler.set_selection_tracker(Box::new(recorder.clone()));
        reconciler.set_renderer(Box::new(recorder.clone()));

        reconciler
            .reconcile(remote(3, 101), &session, &mut store, &mut history)
            .unwrap();
        reconciler
            .reconcile(remote(1, 102), &session, &mut store, &mut history)
            .unwrap();

        assert_eq!(
            *recorder.reattached.lock().unwrap(),
            vec![Some(CellRef::new(2, 1)), None]
        );
        assert_eq!(*recorder.rendered.lock().unwrap(), 2);
    }

    #[test]
    fn has_changes_without_payload_is_a_decode_error() {
        let response = ChangesResponse {
            has_changes: true,
            ..ChangesResponse::default()
        };
        assert!(matches!(
            PollResult::try_from(response),
            Err(TransportError::Decode(_))
        ));
    }
}
