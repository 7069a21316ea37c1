use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::cell::CellRef;
use crate::error::DocumentError;
use crate::history::Snapshot;
use crate::schema::Schema;

/// Server-issued freshness marker. Only ever compared, never interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Row = Vec<String>;

/// Rows of string cells under a fixed schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    schema: Schema,
    rows: Vec<Row>,
}

/// A cell whose value fails its column's advisory check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub cell: CellRef,
    pub reason: &'static str,
}

impl Document {
    pub fn new(schema: Schema) -> Self {
        Document {
            schema,
            rows: Vec::new(),
        }
    }

    /// Builds a document from untrusted rows, rejecting any row whose width
    /// differs from the schema.
    pub fn from_rows(schema: Schema, rows: Vec<Row>) -> Result<Self, DocumentError> {
        let doc = Document { schema, rows };
        doc.check_widths()?;
        Ok(doc)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        self.schema.width()
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row < self.row_count() && cell.col < self.col_count()
    }

    pub fn get(&self, cell: CellRef) -> Option<&str> {
        self.rows
            .get(cell.row)
            .and_then(|row| row.get(cell.col))
            .map(String::as_str)
    }

    pub fn issues(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for (r, row) in self.rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if let Some(reason) = self.schema.kind(c).and_then(|kind| kind.check(value)) {
                    issues.push(ValidationIssue {
                        cell: CellRef::new(r, c),
                        reason,
                    });
                }
            }
        }
        issues
    }

    pub fn into_parts(self) -> (Schema, Vec<Row>) {
        (self.schema, self.rows)
    }

    fn check_widths(&self) -> Result<(), DocumentError> {
        let expected = self.schema.width();
        match self.rows.iter().position(|row| row.len() != expected) {
            Some(row) => Err(DocumentError::WidthMismatch {
                row,
                expected,
                found: self.rows[row].len(),
            }),
            None => Ok(()),
        }
    }

    fn bounds_check(&self, cell: CellRef) -> Result<(), DocumentError> {
        if self.contains(cell) {
            Ok(())
        } else {
            Err(DocumentError::OutOfBounds {
                cell,
                rows: self.row_count(),
                cols: self.col_count(),
            })
        }
    }
}

/// Owner of the live document and of the cursor it was last synced at.
///
/// Only `apply_local_edit` (and the other local mutators) and
/// `replace_with_remote` write to the document. Every local mutation bumps
/// `revision`; the save pipeline clears the dirty flag only for the revision
/// it actually sent.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    document: Document,
    cursor: Cursor,
    revision: u64,
    saved_revision: u64,
}

impl DocumentStore {
    pub fn new(document: Document, cursor: Cursor) -> Self {
        DocumentStore {
            document,
            cursor,
            revision: 0,
            saved_revision: 0,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// Checks that `cell` can be written without growing the document.
    pub fn check_cell(&self, cell: CellRef) -> Result<(), DocumentError> {
        self.document.bounds_check(cell)
    }

    pub fn apply_local_edit(&mut self, cell: CellRef, value: impl Into<String>) -> Result<(), DocumentError> {
        self.document.bounds_check(cell)?;
        self.document.rows[cell.row][cell.col] = value.into();
        self.touch();
        Ok(())
    }

    /// Grows the document by `count` empty rows. Returns the index of the
    /// first new row.
    pub fn append_rows(&mut self, count: usize) -> usize {
        let first = self.document.rows.len();
        let width = self.document.col_count();
        self.document
            .rows
            .extend((0..count).map(|_| vec![String::new(); width]));
        if count > 0 {
            self.touch();
        }
        first
    }

    pub fn delete_rows(&mut self, range: Range<usize>) -> Result<(), DocumentError> {
        let rows = self.document.row_count();
        if range.start > range.end || range.end > rows {
            return Err(DocumentError::RowRange {
                start: range.start,
                end: range.end,
                rows,
            });
        }
        if !range.is_empty() {
            self.document.rows.drain(range);
            self.touch();
        }
        Ok(())
    }

    /// Switches to `schema`, padding short rows with empty cells and
    /// truncating long ones.
    pub fn set_schema(&mut self, schema: Schema) {
        let width = schema.width();
        for row in self.document.rows.iter_mut() {
            row.resize(width, String::new());
        }
        self.document.schema = schema;
        self.touch();
    }

    /// Swaps in a server copy wholesale. Position state held elsewhere is
    /// stale after this call and must be re-resolved.
    pub fn replace_with_remote(&mut self, document: Document, cursor: Cursor) -> Result<(), DocumentError> {
        document.check_widths()?;
        self.document = document;
        self.cursor = cursor;
        self.saved_revision = self.revision;
        Ok(())
    }

    /// Restores the content captured in `snapshot`. Counts as a local
    /// mutation: it must be saved like any edit.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.document = snapshot.document().clone();
        self.touch();
    }

    pub fn snapshot(&self) -> Document {
        self.document.clone()
    }

    /// Moves the cursor forward. A cursor older than the current one is
    /// ignored.
    pub fn advance_cursor(&mut self, cursor: Cursor) -> Cursor {
        if cursor > self.cursor {
            self.cursor = cursor;
        }
        self.cursor
    }

    /// Marks `revision` as persisted. Later local edits keep the store dirty.
    pub fn mark_saved(&mut self, revision: u64) {
        if revision > self.saved_revision && revision <= self.revision {
            self.saved_revision = revision;
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}
