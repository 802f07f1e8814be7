//! Undo and redo that stay correct under remote interleaving.
//!
//! Undoing the latest local operation means applying its inverse, but the
//! inverse was defined for the state right after the operation. Every entry
//! recorded since then (remote edits, earlier undos) is composed and the
//! inverse is transformed past it:
//!
//! ```text
//! history:  ... L  R1  R2  RD1
//!               │  └───────────┘ composed into C
//!               ▼
//!         undo = include(invert(L), C)
//! ```
//!
//! The undone entry stays in the history as plain context and the undo itself
//! is appended as a redoable entry, so the history always lists exactly the
//! operations applied to the buffer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::history::{EditorHistoryEntry, EntryType, OperationHistory, DEFAULT_HISTORY_LIMIT};
use crate::jupiter::DocumentId;
use crate::operation::Operation;
use crate::transform::include;

/// A computed undo or redo that has not touched the history yet.
///
/// Produced by [`UndoManager::plan_undo`] and friends; recorded with
/// [`UndoManager::commit`] once the operation has actually left the site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revert {
    index: usize,
    result: EntryType,
    operation: Operation,
}

impl Revert {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// Thread-safe owner of the session's operation histories, one lock per
/// document.
#[derive(Debug)]
pub struct UndoManager {
    limit: usize,
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<OperationHistory>>>>,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl UndoManager {
    pub fn new(history_limit: usize) -> Self {
        Self {
            limit: history_limit,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, document: DocumentId, entry_type: EntryType, operation: Operation) {
        self.history_mut(document)
            .lock()
            .add(document, entry_type, operation);
    }

    pub fn clear(&self, document: DocumentId) {
        self.documents.write().remove(&document);
    }

    pub fn history_len(&self, document: DocumentId) -> usize {
        self.history(document)
            .map_or(0, |history| history.lock().len(document))
    }

    /// Snapshot of the document's history, newest first.
    pub fn entries(&self, document: DocumentId) -> Vec<EditorHistoryEntry> {
        self.history(document).map_or_else(Vec::new, |history| {
            history.lock().entries(document).cloned().collect()
        })
    }

    pub fn can_undo(&self, document: DocumentId) -> bool {
        self.has_latest(document, EntryType::Local)
    }

    pub fn can_redo(&self, document: DocumentId) -> bool {
        self.has_latest(document, EntryType::Redoable)
    }

    /// The operation undoing the newest local edit, in current coordinates,
    /// recorded in the history right away.
    ///
    /// Returns `NoOperation` when nothing local is left to undo.
    pub fn calc_undo_operation(&self, document: DocumentId) -> Operation {
        self.plan_undo(document)
            .map_or(Operation::NoOperation, |revert| self.commit(document, revert))
    }

    /// The operation redoing the newest undo, in current coordinates,
    /// recorded in the history right away.
    ///
    /// Returns `NoOperation` when nothing is left to redo.
    pub fn calc_redo_operation(&self, document: DocumentId) -> Operation {
        self.plan_redo(document)
            .map_or(Operation::NoOperation, |revert| self.commit(document, revert))
    }

    /// Compute the undo of the newest local edit without recording it.
    ///
    /// The history must not change before the plan is committed; callers
    /// hold the document's lock across both steps.
    pub fn plan_undo(&self, document: DocumentId) -> Option<Revert> {
        self.plan(document, EntryType::Local, EntryType::Redoable)
    }

    /// Compute the redo of the newest undo without recording it.
    pub fn plan_redo(&self, document: DocumentId) -> Option<Revert> {
        self.plan(document, EntryType::Redoable, EntryType::Local)
    }

    /// Record a planned revert: the reverted entry becomes context and the
    /// revert itself is appended.
    pub fn commit(&self, document: DocumentId, revert: Revert) -> Operation {
        let history = self.history_mut(document);
        let mut history = history.lock();
        history.relabel(document, revert.index, EntryType::Remote);
        history.add(document, revert.result, revert.operation.clone());
        log::debug!(
            "document {document}: entry #{} reverted as {:?}",
            revert.index,
            revert.operation
        );
        revert.operation
    }

    fn plan(&self, document: DocumentId, source: EntryType, result: EntryType) -> Option<Revert> {
        let history = self.history(document)?;
        let history = history.lock();
        let index = history.latest(document, source)?;
        let entry = history.get(document, index)?;

        let inverse = entry.operation().invert();
        let since = history.compose_after(document, index);
        let operation = include(&inverse, &since, true);
        Some(Revert {
            index,
            result,
            operation,
        })
    }

    fn has_latest(&self, document: DocumentId, entry_type: EntryType) -> bool {
        self.history(document)
            .is_some_and(|history| history.lock().latest(document, entry_type).is_some())
    }

    fn history(&self, document: DocumentId) -> Option<Arc<Mutex<OperationHistory>>> {
        self.documents.read().get(&document).cloned()
    }

    fn history_mut(&self, document: DocumentId) -> Arc<Mutex<OperationHistory>> {
        if let Some(history) = self.history(document) {
            return history;
        }
        self.documents
            .write()
            .entry(document)
            .or_insert_with(|| Arc::new(Mutex::new(OperationHistory::new(self.limit))))
            .clone()
    }
}
