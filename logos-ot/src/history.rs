//! Bounded per-document history of applied operations.
//!
//! Every operation applied to a document's buffer is recorded in order, so
//! the undo manager can re-express an old local operation in the current
//! coordinate space.

use std::collections::{HashMap, VecDeque};

use crate::jupiter::DocumentId;
use crate::operation::Operation;

/// Default number of entries kept per document.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Provenance of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// A local edit that can be undone.
    Local,
    /// Context only: remote edits and undone operations.
    Remote,
    /// An applied undo that can be redone.
    Redoable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorHistoryEntry {
    entry_type: EntryType,
    operation: Operation,
}

impl EditorHistoryEntry {
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// Oldest entry at the front, newest at the back.
#[derive(Debug)]
pub struct OperationHistory {
    limit: usize,
    documents: HashMap<DocumentId, VecDeque<EditorHistoryEntry>>,
}

impl Default for OperationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl OperationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            documents: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an entry, evicting the oldest once the bound is exceeded.
    pub fn add(&mut self, document: DocumentId, entry_type: EntryType, operation: Operation) {
        let entries = self.documents.entry(document).or_default();
        entries.push_back(EditorHistoryEntry {
            entry_type,
            operation,
        });
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    pub fn len(&self, document: DocumentId) -> usize {
        self.documents.get(&document).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, document: DocumentId) -> bool {
        self.len(document) == 0
    }

    /// Entries for `document`, newest first.
    pub fn entries(&self, document: DocumentId) -> impl Iterator<Item = &EditorHistoryEntry> {
        self.documents
            .get(&document)
            .into_iter()
            .flat_map(|entries| entries.iter().rev())
    }

    pub fn clear(&mut self, document: DocumentId) {
        self.documents.remove(&document);
    }

    /// Index of the newest entry of `entry_type`, counted from the oldest.
    pub(crate) fn latest(&self, document: DocumentId, entry_type: EntryType) -> Option<usize> {
        self.documents
            .get(&document)?
            .iter()
            .rposition(|entry| entry.entry_type == entry_type)
    }

    pub(crate) fn get(&self, document: DocumentId, index: usize) -> Option<&EditorHistoryEntry> {
        self.documents.get(&document)?.get(index)
    }

    /// Every entry newer than `index`, composed oldest to newest.
    pub(crate) fn compose_after(&self, document: DocumentId, index: usize) -> Operation {
        self.documents
            .get(&document)
            .into_iter()
            .flat_map(|entries| entries.iter().skip(index + 1))
            .fold(Operation::NoOperation, |acc, entry| {
                acc.compose(entry.operation.clone())
            })
    }

    pub(crate) fn relabel(&mut self, document: DocumentId, index: usize, entry_type: EntryType) {
        if let Some(entry) = self
            .documents
            .get_mut(&document)
            .and_then(|entries| entries.get_mut(index))
        {
            entry.entry_type = entry_type;
        }
    }
}
