//! File-backed event store.
//!
//! Events live as one JSON document each under a two-level sharded tree
//! (`events/aa/bb/<id>.json`), with the raw inbound frames appended to
//! `log/events.ndjson` for tailing and replay debugging.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use serde_json::to_writer;
use walkdir::WalkDir;

use crate::event::Event;

/// Persistent store for relay events rooted at `root`.
#[derive(Clone)]
pub struct EventStore {
    root: PathBuf,
}

impl EventStore {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "log", "blobs/refs", "blobs/mirror"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Whether an event with this ID is already stored.
    pub fn contains(&self, id: &str) -> bool {
        event_path(&self.root, id).map_or(false, |p| p.exists())
    }

    /// Persist an event plus the raw frame it arrived in. Returns `false`
    /// if the event was already stored.
    pub fn ingest(&self, ev: &Event, raw: &str) -> Result<bool> {
        let path = event_path(&self.root, &ev.id)?;
        if path.exists() {
            return Ok(false);
        }
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        to_writer(&tmp, ev)?;
        tmp.persist(&path)?;

        let log_path = self.root.join("log/events.ndjson");
        let mut log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        log_file.write_all(raw.trim_end().as_bytes())?;
        log_file.write_all(b"\n")?;
        Ok(true)
    }

    /// Load every stored event, newest first.
    pub fn all(&self) -> Result<Vec<Event>> {
        let mut events = vec![];
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let data = fs::read_to_string(entry.path())?;
            match serde_json::from_str::<Event>(&data) {
                Ok(ev) => events.push(ev),
                Err(e) => log::warn!("skipping unreadable event {:?}: {e}", entry.path()),
            }
        }
        events.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        Ok(events)
    }

    /// Number of stored events.
    pub fn count(&self) -> u64 {
        WalkDir::new(self.root.join("events"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64
    }

    /// Total bytes under the store root.
    pub fn storage_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Compute the canonical sharded path for an event ID.
fn event_path(root: &Path, id: &str) -> Result<PathBuf> {
    if id.len() < 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("malformed event id: {id}");
    }
    let sub1 = &id[0..2];
    let sub2 = &id[2..4];
    Ok(root
        .join("events")
        .join(sub1)
        .join(sub2)
        .join(format!("{}.json", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use tempfile::TempDir;

    fn sample_event(id: &str, created: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p1".into(),
            kind: 1,
            created_at: created,
            tags: vec![Tag(vec!["room".into(), "alpha".into()])],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn init_and_ingest() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        let ev = sample_event("abcd", 1);
        assert!(store.ingest(&ev, "{\"raw\":1}").unwrap());
        assert!(!store.ingest(&ev, "{\"raw\":1}").unwrap());
        assert!(store.contains("abcd"));
        assert!(dir.path().join("events/ab/cd/abcd.json").exists());
        let log = fs::read_to_string(dir.path().join("log/events.ndjson")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn all_returns_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        store.ingest(&sample_event("aa11", 1), "{}").unwrap();
        store.ingest(&sample_event("bb22", 3), "{}").unwrap();
        store.ingest(&sample_event("cc33", 2), "{}").unwrap();
        let ids: Vec<String> = store.all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["bb22", "cc33", "aa11"]);
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn rejects_malformed_ids() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        assert!(store.ingest(&sample_event("ab", 1), "{}").is_err());
        assert!(store.ingest(&sample_event("../../x", 1), "{}").is_err());
    }

    #[test]
    fn storage_bytes_grows() {
        let dir = TempDir::new().unwrap();
        let store = EventStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        let before = store.storage_bytes();
        store.ingest(&sample_event("abcd", 1), "{}").unwrap();
        assert!(store.storage_bytes() > before);
    }
}
