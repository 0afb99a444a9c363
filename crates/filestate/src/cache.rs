//! Bounded least-recently-used cache of [`FileSpecificState`].
//!
//! Eviction only drops the in-memory copy; durable records are untouched.

use std::collections::{BTreeMap, HashMap};

use crate::types::FileSpecificState;

#[derive(Debug)]
struct CacheEntry {
    state: FileSpecificState,
    last_used: u64,
}

#[derive(Debug)]
pub struct FileStateCache {
    max_size: usize,
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

impl FileStateCache {
    /// A cache holding at most `max_size` entries (at least one).
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: HashMap::new(),
            tick: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.entries.contains_key(file_path)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, file_path: &str) -> Option<&FileSpecificState> {
        self.get_mut(file_path).map(|s| &*s)
    }

    pub fn get_mut(&mut self, file_path: &str) -> Option<&mut FileSpecificState> {
        let tick = self.next_tick();
        self.entries.get_mut(file_path).map(|entry| {
            entry.last_used = tick;
            &mut entry.state
        })
    }

    /// Look up an entry without touching its recency.
    pub fn peek(&self, file_path: &str) -> Option<&FileSpecificState> {
        self.entries.get(file_path).map(|e| &e.state)
    }

    /// Insert or replace an entry, then evict down to capacity.
    ///
    /// `protected` is never evicted. Returns the evicted paths.
    pub fn insert(&mut self, state: FileSpecificState, protected: Option<&str>) -> Vec<String> {
        let tick = self.next_tick();
        self.entries.insert(
            state.file_path.clone(),
            CacheEntry {
                state,
                last_used: tick,
            },
        );
        self.evict_overflow(protected)
    }

    pub fn remove(&mut self, file_path: &str) -> Option<FileSpecificState> {
        self.entries.remove(file_path).map(|e| e.state)
    }

    /// Evict least-recently-used entries other than `protected` until the
    /// cache fits.
    pub fn evict_overflow(&mut self, protected: Option<&str>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            let victim = self
                .entries
                .iter()
                .filter(|(path, _)| Some(path.as_str()) != protected)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone());
            match victim {
                Some(path) => {
                    self.entries.remove(&path);
                    evicted.push(path);
                }
                None => break,
            }
        }
        evicted
    }

    /// Cached paths, least recently used first.
    pub fn paths(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.last_used);
        entries.into_iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, FileSpecificState> {
        self.entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.state.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
