use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use loom_protocol::{ConversationError, ConversationResult};
use parking_lot::Mutex;
use tracing::debug;

/// Flat namespace of named text records backing an event log.
pub trait RecordStore: Send + Sync {
    fn list(&self) -> ConversationResult<Vec<String>>;
    fn read(&self, name: &str) -> ConversationResult<String>;
    fn write(&self, name: &str, contents: &str) -> ConversationResult<()>;
}

/// One file per record under `root`.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl RecordStore for FileRecordStore {
    fn list(&self) -> ConversationResult<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_owned());
            }
        }
        names.sort();
        debug!(root = %self.root.display(), count = names.len(), "records listed");
        Ok(names)
    }

    fn read(&self, name: &str) -> ConversationResult<String> {
        let path = self.root.join(name);
        fs::read_to_string(&path).map_err(|error| {
            ConversationError::Io(format!("failed reading record {}: {error}", path.display()))
        })
    }

    fn write(&self, name: &str, contents: &str) -> ConversationResult<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        fs::write(&path, contents).map_err(|error| {
            ConversationError::Io(format!("failed writing record {}: {error}", path.display()))
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<String, String>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn list(&self) -> ConversationResult<Vec<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    fn read(&self, name: &str) -> ConversationResult<String> {
        self.records
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ConversationError::EventNotFound(name.to_owned()))
    }

    fn write(&self, name: &str, contents: &str) -> ConversationResult<()> {
        self.records
            .lock()
            .insert(name.to_owned(), contents.to_owned());
        Ok(())
    }
}
