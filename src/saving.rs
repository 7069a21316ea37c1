use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::history::{HistoryStore, Snapshot};

/// Writes `value` as gzip-compressed bincode. The file is written next to
/// its destination first and renamed into place.
pub fn save_compressed<T: Serialize>(value: &T, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut writer = BufWriter::new(encoder);
        serialize_into(&mut writer, value)?;
        writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?
            .finish()?
            .flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_compressed<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut reader = BufReader::new(decoder);
    Ok(deserialize_from(&mut reader)?)
}

/// File name safe to use for an arbitrary document id.
pub fn file_stem(document_id: &str) -> String {
    document_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// History store keeping one `<id>.history.bin.gz` per document.
pub struct DiskHistoryStore {
    dir: PathBuf,
}

impl DiskHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiskHistoryStore { dir: dir.into() }
    }

    fn path(&self, document_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.history.bin.gz", file_stem(document_id)))
    }
}

impl HistoryStore for DiskHistoryStore {
    fn persist(&mut self, document_id: &str, entries: &[Snapshot]) -> Result<(), StorageError> {
        save_compressed(&entries, &self.path(document_id))
    }

    fn load(&mut self, document_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let path = self.path(document_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        load_compressed(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellRef;
    use crate::document::{Cursor, Document, DocumentStore};
    use crate::history::{Action, UndoManager};
    use crate::schema::Schema;

    #[test]
    fn history_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DocumentStore::new(Document::new(Schema::from_tags(&["email", "secret"])), Cursor(5));
        store.append_rows(1);

        let mut undo = UndoManager::default().with_store("team/doc 1", Box::new(DiskHistoryStore::new(dir.path())), 10);
        for value in ["a", "b", "c"] {
            undo.push_undo(&store, Action::edit(CellRef::new(0, 1)));
            store.apply_local_edit(CellRef::new(0, 1), value).unwrap();
        }

        let mut reopened = UndoManager::default().with_store("team/doc 1", Box::new(DiskHistoryStore::new(dir.path())), 10);
        assert_eq!(reopened.undo_len(), 3);
        reopened.undo(&mut store).unwrap();
        assert_eq!(store.document().get(CellRef::new(0, 1)), Some("b"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskHistoryStore::new(dir.path());
        assert!(disk.load("nothing").unwrap().is_empty());
    }

    #[test]
    fn file_stem_strips_path_characters() {
        assert_eq!(file_stem("../a b/c"), "___a_b_c");
    }
}
