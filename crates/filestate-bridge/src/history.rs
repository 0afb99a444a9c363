//! Undo/redo history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default bound on the undo stack.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

type Procedure = Arc<dyn Fn() + Send + Sync>;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A reversible user action.
#[derive(Clone)]
pub struct UndoableAction {
    pub id: u64,
    pub action_type: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    undo: Procedure,
    redo: Procedure,
}

impl UndoableAction {
    pub fn new(
        action_type: impl Into<String>,
        label: impl Into<String>,
        undo: impl Fn() + Send + Sync + 'static,
        redo: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed),
            action_type: action_type.into(),
            label: label.into(),
            timestamp: Utc::now(),
            undo: Arc::new(undo),
            redo: Arc::new(redo),
        }
    }
}

impl std::fmt::Debug for UndoableAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoableAction")
            .field("id", &self.id)
            .field("action_type", &self.action_type)
            .field("label", &self.label)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Stacks {
    undo: VecDeque<UndoableAction>,
    redo: Vec<UndoableAction>,
}

/// Bounded undo stack plus redo stack.
///
/// Pushing clears the redo stack. Undo and redo never run concurrently: a
/// call made while another is executing returns `false`. The procedures
/// run outside the stack lock, so they may push follow-up actions.
#[derive(Debug)]
pub struct UndoHistory {
    limit: usize,
    stacks: Mutex<Stacks>,
    busy: AtomicBool,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UndoHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            stacks: Mutex::new(Stacks::default()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn push_action(&self, action: UndoableAction) {
        let mut stacks = self.stacks.lock();
        stacks.redo.clear();
        stacks.undo.push_back(action);
        while stacks.undo.len() > self.limit {
            stacks.undo.pop_front();
        }
    }

    fn acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    /// Revert the most recent action. Returns false if there was nothing to
    /// undo or another undo/redo is in progress.
    pub fn undo(&self) -> bool {
        let Some(_guard) = self.acquire() else {
            tracing::debug!("undo skipped: history busy");
            return false;
        };
        let Some(action) = self.stacks.lock().undo.pop_back() else {
            return false;
        };
        (action.undo)();
        self.stacks.lock().redo.push(action);
        true
    }

    pub fn redo(&self) -> bool {
        let Some(_guard) = self.acquire() else {
            tracing::debug!("redo skipped: history busy");
            return false;
        };
        let Some(action) = self.stacks.lock().redo.pop() else {
            return false;
        };
        (action.redo)();
        self.stacks.lock().undo.push_back(action);
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.lock().redo.is_empty()
    }

    pub fn undo_label(&self) -> Option<String> {
        self.stacks.lock().undo.back().map(|a| a.label.clone())
    }

    pub fn redo_label(&self) -> Option<String> {
        self.stacks.lock().redo.last().map(|a| a.label.clone())
    }

    pub fn len(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut stacks = self.stacks.lock();
        stacks.undo.clear();
        stacks.redo.clear();
    }
}
