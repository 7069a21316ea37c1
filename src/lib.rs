/*!
# Sheetsync

Optimistic editing and polling sync for a shared spreadsheet of
credential-like records (emails, secrets, links, tags, notes).

## Overview

A client holds the whole document in memory and applies every edit locally
first. Edits are saved to the server as a full document after a short
debounce, with a bounded number of retries. Changes made by other
collaborators are picked up by polling a "changes since cursor" endpoint,
faster for a while after any activity. Local undo/redo works on whole
document snapshots and never talks to the network by itself.

## Architecture

### Client engine
- **document**: the in-memory table, its schema and the server cursor
- **history**: undo/redo stacks of pre-mutation snapshots
- **persistence**: debounce timer, save requests, linear retry backoff
- **reconciler**: applies polled server state, last writer wins
- **session**: per-document sync state (mode, in-flight guards)
- **scheduler**: drives all of the above on a single task

### Server side
- **repository**: authoritative documents with monotonically increasing cursors
- **access**: owner and invite tokens
- **server** (feature `web`): axum routes for open, changes, save and invites

### Persistence
- Gzip compressed bincode files for documents and recent history
- In-process LRU cache of recent history per document

## Consistency

Reconciliation is last-writer-wins on the whole document. Two editors
changing different cells within one poll window may lose one of the edits.
*/

pub mod access;
pub mod cache;
pub mod cell;
pub mod config;
pub mod document;
pub mod error;
pub mod history;
pub mod persistence;
pub mod reconciler;
pub mod repository;
pub mod saving;
pub mod scheduler;
pub mod schema;
#[cfg(feature = "web")]
pub mod server;
pub mod session;
pub mod transport;

pub use cell::CellRef;
pub use config::{ServerConfig, SyncConfig};
pub use document::{Cursor, Document, DocumentStore};
pub use error::*;
pub use history::{Action, ActionKind, Snapshot, UndoManager};
pub use repository::DocumentRepository;
pub use scheduler::{Command, HistorySource, SyncEvent, SyncScheduler};
pub use schema::{FieldKind, Schema};
pub use session::{SyncMode, SyncSession};
pub use transport::{DocumentBackend, MemoryBackend};
