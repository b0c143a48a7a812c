//! Page-identity index: source id / title to destination id.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{Result, SyncError};

/// Identity of one page across the two stores.
///
/// The destination id starts unset and is written exactly once, by the
/// orchestrator, right after the destination copy is created or updated.
#[derive(Debug)]
pub struct PageRecord {
    pub source_id: String,
    pub source_space: String,
    pub source_title: String,
    destination_id: OnceLock<String>,
}

impl PageRecord {
    pub fn new(
        source_id: impl Into<String>,
        source_space: impl Into<String>,
        source_title: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_space: source_space.into(),
            source_title: source_title.into(),
            destination_id: OnceLock::new(),
        }
    }

    pub fn destination_id(&self) -> Option<&str> {
        self.destination_id.get().map(String::as_str)
    }

    /// Write-once destination id; a second write is a logic error.
    pub fn set_destination_id(&self, id: impl Into<String>) -> Result<()> {
        self.destination_id.set(id.into()).map_err(|_| {
            SyncError::invariant(format!(
                "destination id written twice for source page {}",
                self.source_id
            ))
        })
    }
}

/// Registry of all [`PageRecord`]s of a run.
///
/// Records are only ever added, never removed, so resolution against the
/// index is monotonic: "not found" can become "found", never the reverse.
#[derive(Debug, Default)]
pub struct PageIndex {
    inner: RwLock<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    by_id: HashMap<String, Arc<PageRecord>>,
    by_title: HashMap<(String, String), Arc<PageRecord>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record under both lookup keys. Duplicate keys indicate a
    /// bug in discovery and are rejected.
    pub fn add_page(&self, record: PageRecord) -> Result<Arc<PageRecord>> {
        let mut maps = self.inner.write();

        if maps.by_id.contains_key(&record.source_id) {
            return Err(SyncError::invariant(format!(
                "page {} registered twice",
                record.source_id
            )));
        }
        let title_key = (record.source_space.clone(), record.source_title.clone());
        if maps.by_title.contains_key(&title_key) {
            return Err(SyncError::invariant(format!(
                "page \"{}\" in space \"{}\" registered twice",
                record.source_title, record.source_space
            )));
        }

        let record = Arc::new(record);
        maps.by_id.insert(record.source_id.clone(), record.clone());
        maps.by_title.insert(title_key, record.clone());
        Ok(record)
    }

    pub fn search_by_id(&self, source_id: &str) -> Option<Arc<PageRecord>> {
        self.inner.read().by_id.get(source_id).cloned()
    }

    pub fn search_by_title(&self, space: &str, title: &str) -> Option<Arc<PageRecord>> {
        self.inner
            .read()
            .by_title
            .get(&(space.to_string(), title.to_string()))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }
}
