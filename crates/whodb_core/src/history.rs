use crate::{DatabaseKind, EngineError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// A single executed-query history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub query: String,
    pub timestamp: i64,
    pub kind: DatabaseKind,
    pub database: Option<String>,
    pub execution_time_ms: u64,
    pub row_count: Option<usize>,
    #[serde(default)]
    pub is_favorite: bool,
}

impl HistoryEntry {
    pub fn new(
        query: String,
        kind: DatabaseKind,
        database: Option<String>,
        execution_time: Duration,
        row_count: Option<usize>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            timestamp: chrono::Utc::now().timestamp(),
            kind,
            database,
            execution_time_ms: execution_time.as_millis() as u64,
            row_count,
            is_favorite: false,
        }
    }
}

/// Persistent store for query history (`history.json` in the data dir).
pub struct HistoryStore {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
    max_entries: usize,
}

impl HistoryStore {
    const DEFAULT_MAX_ENTRIES: usize = 1000;

    pub fn open() -> Result<Self, EngineError> {
        Self::open_at(crate::config::data_dir()?.join("history.json"))
    }

    pub fn open_at(path: PathBuf) -> Result<Self, EngineError> {
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| EngineError::internal(format!("corrupt history file: {e}")))?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            entries,
            max_entries: Self::DEFAULT_MAX_ENTRIES,
        })
    }

    pub fn save(&self) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn add(&mut self, entry: HistoryEntry) {
        self.entries.insert(0, entry);
        self.enforce_cap();
    }

    /// Keep favorites, drop the oldest non-favorites beyond the cap.
    fn enforce_cap(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }

        let favorites: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.is_favorite)
            .cloned()
            .collect();

        let non_favorites: Vec<_> = self
            .entries
            .iter()
            .filter(|e| !e.is_favorite)
            .take(self.max_entries.saturating_sub(favorites.len()))
            .cloned()
            .collect();

        self.entries = favorites;
        self.entries.extend(non_favorites);
        self.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    pub fn set_max_entries(&mut self, max: usize) {
        self.max_entries = max.max(10);
        self.enforce_cap();
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn toggle_favorite(&mut self, id: Uuid) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.is_favorite = !entry.is_favorite;
            return entry.is_favorite;
        }
        false
    }

    pub fn remove(&mut self, id: Uuid) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn clear_non_favorites(&mut self) {
        self.entries.retain(|e| e.is_favorite);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(query: &str) -> HistoryEntry {
        HistoryEntry::new(
            query.to_string(),
            DatabaseKind::Postgres,
            Some("app".into()),
            Duration::from_millis(3),
            Some(1),
        )
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::open_at(path.clone()).unwrap();
        store.add(entry("SELECT 1"));
        store.save().unwrap();

        let reopened = HistoryStore::open_at(path).unwrap();
        assert_eq!(reopened.entries().len(), 1);
        assert_eq!(reopened.entries()[0].query, "SELECT 1");
    }

    #[test]
    fn cap_keeps_favorites() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open_at(dir.path().join("history.json")).unwrap();
        store.set_max_entries(10);

        let favorite = entry("SELECT 'keep me'");
        let favorite_id = favorite.id;
        store.add(favorite);
        store.toggle_favorite(favorite_id);

        for i in 0..20 {
            store.add(entry(&format!("SELECT {i}")));
        }

        assert!(store.entries().len() <= 11);
        assert!(store.entries().iter().any(|e| e.id == favorite_id));
    }
}
