use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::document::{Cursor, Document};
use crate::error::{RepositoryError, StorageError};
use crate::saving::{file_stem, load_compressed, save_compressed};
use crate::schema::Schema;
use crate::transport::{ChangesResponse, SaveRequest};

/// Server copy of one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document_id: String,
    pub document: Document,
    pub cursor: Cursor,
    pub last_editor: Option<String>,
}

/// Authoritative store behind the changes/save protocol.
///
/// Cursors are wall-clock milliseconds, bumped past the previous cursor
/// when the clock has not moved, so every save gets a strictly larger one.
pub struct DocumentRepository {
    documents: Mutex<HashMap<String, StoredDocument>>,
    data_dir: Option<PathBuf>,
}

impl Default for DocumentRepository {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DocumentRepository {
    pub fn in_memory() -> Self {
        DocumentRepository {
            documents: Mutex::new(HashMap::new()),
            data_dir: None,
        }
    }

    /// Opens a repository persisted under `dir`, loading every
    /// `*.bin.gz` document already there. Unreadable files are skipped.
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut documents = HashMap::new();
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !name.ends_with(".doc.bin.gz") {
                continue;
            }
            match load_compressed::<StoredDocument>(&path) {
                Ok(stored) => {
                    documents.insert(stored.document_id.clone(), stored);
                }
                Err(e) => log::warn!("skipping unreadable document {}: {}", path.display(), e),
            }
        }
        log::info!("loaded {} document(s) from {}", documents.len(), dir.display());
        Ok(DocumentRepository {
            documents: Mutex::new(documents),
            data_dir: Some(dir),
        })
    }

    pub fn create(&self, document_id: &str, schema: Schema, editor: &str) -> Result<Cursor, RepositoryError> {
        let mut documents = self.lock()?;
        if documents.contains_key(document_id) {
            return Err(RepositoryError::AlreadyExists(document_id.to_string()));
        }
        let stored = StoredDocument {
            document_id: document_id.to_string(),
            document: Document::new(schema),
            cursor: next_cursor(Cursor::default()),
            last_editor: Some(editor.to_string()),
        };
        self.persist(&stored)?;
        let cursor = stored.cursor;
        documents.insert(document_id.to_string(), stored);
        Ok(cursor)
    }

    pub fn open(&self, document_id: &str) -> Result<(Document, Cursor), RepositoryError> {
        let documents = self.lock()?;
        let stored = documents
            .get(document_id)
            .ok_or_else(|| RepositoryError::NotFound(document_id.to_string()))?;
        Ok((stored.document.clone(), stored.cursor))
    }

    /// Whole document if it changed after `since`. Has no side effects.
    pub fn changes_since(&self, document_id: &str, since: Cursor) -> Result<ChangesResponse, RepositoryError> {
        let documents = self.lock()?;
        let stored = documents
            .get(document_id)
            .ok_or_else(|| RepositoryError::NotFound(document_id.to_string()))?;
        if stored.cursor <= since {
            return Ok(ChangesResponse::unchanged());
        }
        Ok(ChangesResponse {
            has_changes: true,
            data: Some(stored.document.clone()),
            last_edit_time: Some(stored.cursor),
            last_editor: stored.last_editor.clone(),
        })
    }

    /// Replaces the stored document wholesale and returns its new cursor.
    pub fn save(&self, request: SaveRequest, editor: &str) -> Result<Cursor, RepositoryError> {
        let document = Document::from_rows(request.schema, request.rows)?;
        let mut documents = self.lock()?;
        let stored = documents
            .get_mut(&request.document_id)
            .ok_or_else(|| RepositoryError::NotFound(request.document_id.clone()))?;

        let updated = StoredDocument {
            document_id: request.document_id.clone(),
            document,
            cursor: next_cursor(stored.cursor),
            last_editor: Some(editor.to_string()),
        };
        self.persist(&updated)?;
        *stored = updated;
        log::debug!("saved {} at cursor {} by {}", request.document_id, stored.cursor, editor);
        Ok(stored.cursor)
    }

    pub fn delete(&self, document_id: &str) -> Result<(), RepositoryError> {
        let mut documents = self.lock()?;
        if documents.remove(document_id).is_none() {
            return Err(RepositoryError::NotFound(document_id.to_string()));
        }
        if let Some(dir) = &self.data_dir {
            let path = dir.join(format!("{}.doc.bin.gz", file_stem(document_id)));
            fs::remove_file(path).map_err(StorageError::from)?;
        }
        Ok(())
    }

    fn persist(&self, stored: &StoredDocument) -> Result<(), StorageError> {
        if let Some(dir) = &self.data_dir {
            let path = dir.join(format!("{}.doc.bin.gz", file_stem(&stored.document_id)));
            save_compressed(stored, &path)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredDocument>>, StorageError> {
        self.documents
            .lock()
            .map_err(|_| StorageError::Config("document table poisoned".into()))
    }
}

fn next_cursor(previous: Cursor) -> Cursor {
    Cursor(Utc::now().timestamp_millis().max(previous.0 + 1))
}
