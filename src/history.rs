//! Local undo/redo history.
//!
//! Each committed local mutation records a [`Snapshot`] of the document as it
//! was *before* the mutation. Undo swaps the live document with the top
//! snapshot and parks the current state on the redo stack; redo is the mirror
//! image. The history never touches the network: callers schedule a save
//! after undo/redo like after any other edit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::cell::CellRef;
use crate::document::{Document, DocumentStore};
use crate::error::{HistoryError, StorageError};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_PERSISTED_ENTRIES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Edit,
    Paste,
    Clear,
    AppendRows,
    DeleteRows,
    SchemaChange,
}

/// Page of the table the user was looking at when the action happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub page: usize,
    pub page_size: usize,
}

/// What a snapshot was recorded for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub description: String,
    pub affected_cells: Vec<CellRef>,
    pub page: Option<PageContext>,
}

impl Action {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Action {
            kind,
            description: description.into(),
            affected_cells: Vec::new(),
            page: None,
        }
    }

    pub fn edit(cell: CellRef) -> Self {
        Action {
            kind: ActionKind::Edit,
            description: format!("Edit {}", cell),
            affected_cells: vec![cell],
            page: None,
        }
    }

    pub fn with_cells(mut self, cells: Vec<CellRef>) -> Self {
        self.affected_cells = cells;
        self
    }

    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = Some(page);
        self
    }
}

/// Immutable copy of a document plus the action it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    id: Uuid,
    timestamp: DateTime<Utc>,
    action: Action,
    document: Document,
}

impl Snapshot {
    pub fn capture(store: &DocumentStore, action: Action) -> Self {
        Snapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            document: store.snapshot(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn same_content(&self, document: &Document) -> bool {
        &self.document == document
    }
}

/// Best-effort durable home for the most recent history entries.
pub trait HistoryStore: Send {
    fn persist(&mut self, document_id: &str, entries: &[Snapshot]) -> Result<(), StorageError>;

    fn load(&mut self, document_id: &str) -> Result<Vec<Snapshot>, StorageError>;
}

pub struct UndoManager {
    undo: VecDeque<Snapshot>,
    redo: VecDeque<Snapshot>,
    limit: usize,
    persisted_entries: usize,
    store: Option<(String, Box<dyn HistoryStore>)>,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl UndoManager {
    pub fn new(limit: usize) -> Self {
        UndoManager {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            limit: limit.max(1),
            persisted_entries: DEFAULT_PERSISTED_ENTRIES,
            store: None,
        }
    }

    /// Attaches a durable store and reloads whatever it still holds for
    /// `document_id`. Load failures leave the history empty.
    pub fn with_store(
        mut self,
        document_id: impl Into<String>,
        mut store: Box<dyn HistoryStore>,
        persisted_entries: usize,
    ) -> Self {
        let document_id = document_id.into();
        match store.load(&document_id) {
            Ok(entries) => {
                let skip = entries.len().saturating_sub(self.limit);
                self.undo = entries.into_iter().skip(skip).collect();
            }
            Err(e) => log::debug!("history for {} not restored: {}", document_id, e),
        }
        self.persisted_entries = persisted_entries;
        self.store = Some((document_id, store));
        self
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn top(&self) -> Option<&Snapshot> {
        self.undo.back()
    }

    /// Records the current content of `store` before a mutation described by
    /// `action`. Returns false, changing nothing, when the content equals the
    /// top entry.
    pub fn push_undo(&mut self, store: &DocumentStore, action: Action) -> bool {
        self.push_snapshot(Snapshot::capture(store, action))
    }

    /// Records a snapshot captured earlier, with the same dedup rule as
    /// [`UndoManager::push_undo`].
    pub fn push_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if self
            .undo
            .back()
            .is_some_and(|top| top.same_content(snapshot.document()))
        {
            return false;
        }
        Self::push_bounded(&mut self.undo, snapshot, self.limit);
        self.redo.clear();
        self.persist();
        true
    }

    /// Restores the most recent snapshot. The state it replaces moves to the
    /// redo stack. Returns the undone action.
    pub fn undo(&mut self, store: &mut DocumentStore) -> Result<Action, HistoryError> {
        let snapshot = self.undo.pop_back().ok_or(HistoryError::NothingToUndo)?;
        let current = Snapshot::capture(store, snapshot.action.clone());
        Self::push_bounded(&mut self.redo, current, self.limit);
        store.restore(&snapshot);
        self.persist();
        Ok(snapshot.action)
    }

    pub fn redo(&mut self, store: &mut DocumentStore) -> Result<Action, HistoryError> {
        let snapshot = self.redo.pop_back().ok_or(HistoryError::NothingToRedo)?;
        let current = Snapshot::capture(store, snapshot.action.clone());
        Self::push_bounded(&mut self.undo, current, self.limit);
        store.restore(&snapshot);
        self.persist();
        Ok(snapshot.action)
    }

    /// Drops the redo timeline, used when a remote replace diverges from it.
    pub fn reset_redo(&mut self) {
        self.redo.clear();
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.persist();
    }

    fn push_bounded(stack: &mut VecDeque<Snapshot>, snapshot: Snapshot, limit: usize) {
        stack.push_back(snapshot);
        while stack.len() > limit {
            stack.pop_front();
        }
    }

    fn persist(&mut self) {
        let Some((document_id, store)) = self.store.as_mut() else {
            return;
        };
        let skip = self.undo.len().saturating_sub(self.persisted_entries);
        let recent: Vec<Snapshot> = self.undo.iter().skip(skip).cloned().collect();
        if let Err(e) = store.persist(document_id, &recent) {
            log::debug!("history for {} not persisted: {}", document_id, e);
        }
    }
}
