//! Client side of the Jupiter protocol, one state per shared document.
//!
//! Provides:
//! - Local edits stamped for the server and recorded as undoable history
//! - Remote requests transformed past unacknowledged local edits
//! - A reorder buffer for requests that arrive ahead of a gap
//! - Undo/redo sent through the same Jupiter state
//! - An edit gate the stop manager closes during recovery
//!
//! Every document has its own mutex; the undo history is only locked while a
//! document lock is held, never the other way round.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checksum::ChecksumActivity;
use crate::history::EntryType;
use crate::jupiter::{
    DocumentId, JupiterDocumentState, JupiterError, Request, SiteId, SiteRole, VectorTime,
};
use crate::operation::Operation;
use crate::stop::Blockable;
use crate::undo::{Revert, UndoManager};

/// Closed by the stop manager while a remote host holds a lock on us.
#[derive(Debug, Default)]
pub struct EditGate {
    blocked: AtomicBool,
}

impl EditGate {
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }
}

impl Blockable for EditGate {
    fn block(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    fn unblock(&self) {
        self.blocked.store(false, Ordering::Release);
    }
}

/// Requests that arrived before their predecessors, keyed by the sender's
/// local count.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, Request>,
    max_size: usize,
}

impl ReorderBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_size,
        }
    }

    /// Hold a request back. Returns `false` if full or already held.
    pub fn insert(&mut self, request: Request) -> bool {
        if self.pending.len() >= self.max_size || self.pending.contains_key(&request.time.local) {
            return false;
        }
        self.pending.insert(request.time.local, request);
        true
    }

    /// Remove the request the peer generated as its `sequence`-th.
    pub fn take(&mut self, sequence: u64) -> Option<Request> {
        self.pending.remove(&sequence)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug)]
struct ClientDocument {
    jupiter: JupiterDocumentState,
    reorder: ReorderBuffer,
}

impl ClientDocument {
    fn new(document: DocumentId, max_buffered: usize) -> Self {
        Self {
            jupiter: JupiterDocumentState::new(document, SiteRole::Client),
            reorder: ReorderBuffer::new(max_buffered),
        }
    }
}

/// The local site's end of every shared document.
pub struct ConcurrentDocumentClient {
    local_site: SiteId,
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<ClientDocument>>>>,
    undo: Arc<UndoManager>,
    gate: Arc<EditGate>,
    max_buffered_requests: usize,
}

impl ConcurrentDocumentClient {
    pub fn new(local_site: SiteId, undo: Arc<UndoManager>, max_buffered_requests: usize) -> Self {
        Self {
            local_site,
            documents: RwLock::new(HashMap::new()),
            undo,
            gate: Arc::new(EditGate::default()),
            max_buffered_requests,
        }
    }

    pub fn local_site(&self) -> SiteId {
        self.local_site
    }

    /// The gate to register with the stop manager.
    pub fn gate(&self) -> Arc<EditGate> {
        self.gate.clone()
    }

    /// Start tracking a document. Returns `false` if it was already shared.
    pub fn add_document(&self, document: DocumentId) -> bool {
        let mut documents = self.documents.write();
        if documents.contains_key(&document) {
            return false;
        }
        documents.insert(
            document,
            Arc::new(Mutex::new(ClientDocument::new(document, self.max_buffered_requests))),
        );
        log::debug!("client {}: sharing {document}", self.local_site);
        true
    }

    /// Stop tracking a document and drop its history.
    pub fn remove_document(&self, document: DocumentId) -> bool {
        let removed = self.documents.write().remove(&document).is_some();
        if removed {
            self.undo.clear(document);
            log::debug!("client {}: unshared {document}", self.local_site);
        }
        removed
    }

    /// Restart the document's Jupiter state after its content was replaced.
    pub fn reset(&self, document: DocumentId) -> Result<(), JupiterError> {
        let shared = self.document(document)?;
        let mut state = shared.lock();
        *state = ClientDocument::new(document, self.max_buffered_requests);
        self.undo.clear(document);
        log::info!("client {}: reset {document}", self.local_site);
        Ok(())
    }

    pub fn is_shared(&self, document: DocumentId) -> bool {
        self.documents.read().contains_key(&document)
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        self.documents.read().keys().copied().collect()
    }

    pub fn vector_time(&self, document: DocumentId) -> Result<VectorTime, JupiterError> {
        Ok(self.document(document)?.lock().jupiter.vector_time())
    }

    /// Requests received ahead of a gap and not yet applied.
    pub fn buffered_len(&self, document: DocumentId) -> Result<usize, JupiterError> {
        Ok(self.document(document)?.lock().reorder.len())
    }

    /// Stamp a local edit for the server and record it as undoable.
    ///
    /// Nothing is recorded if sending fails: the Jupiter state and history
    /// are as they were before the call.
    pub fn handle_local_edit(
        &self,
        document: DocumentId,
        operation: Operation,
    ) -> Result<Request, JupiterError> {
        self.handle_local_edit_with(document, operation, |_| Ok::<_, JupiterError>(()))
    }

    /// Like [`handle_local_edit`](Self::handle_local_edit), handing the
    /// request to `send` while the document is still locked so requests leave
    /// in generation order.
    pub fn handle_local_edit_with<E, F>(
        &self,
        document: DocumentId,
        operation: Operation,
        send: F,
    ) -> Result<Request, E>
    where
        E: From<JupiterError>,
        F: FnOnce(&Request) -> Result<(), E>,
    {
        let shared = self.document(document)?;
        self.ensure_open(document)?;

        let mut state = shared.lock();
        let request = state.jupiter.generate(operation.clone(), self.local_site);
        if let Err(err) = send(&request) {
            state.jupiter.retract();
            return Err(err);
        }
        self.undo.add(document, EntryType::Local, operation);
        Ok(request)
    }

    /// Apply a relayed request, plus any buffered ones it unblocks.
    ///
    /// Returns the transformed operations in the order they must be applied
    /// to the local buffer. A request from further ahead is held back and
    /// yields nothing yet.
    pub fn receive_remote_operation(&self, request: &Request) -> Result<Vec<Operation>, JupiterError> {
        let mut applied = Vec::new();
        self.receive_remote_operation_with(request, |operation| applied.push(operation.clone()))?;
        Ok(applied)
    }

    /// Like [`receive_remote_operation`](Self::receive_remote_operation),
    /// rendering each operation while the document is still locked so no
    /// local edit can slip in between. Returns the number rendered.
    pub fn receive_remote_operation_with<F>(&self, request: &Request, mut render: F) -> Result<usize, JupiterError>
    where
        F: FnMut(&Operation),
    {
        let shared = self.document(request.document)?;
        let mut state = shared.lock();

        if state.jupiter.is_premature(request) {
            if !state.reorder.insert(request.clone()) {
                return Err(JupiterError::CausalityViolation {
                    document: request.document,
                    detail: format!(
                        "cannot hold back request {} ({} already buffered)",
                        request.time,
                        state.reorder.len()
                    ),
                });
            }
            log::debug!(
                "client {}: buffered early request {} on {}",
                self.local_site,
                request.time,
                request.document
            );
            return Ok(0);
        }

        render(&self.apply(&mut state, request)?);
        let mut rendered = 1;
        loop {
            let next = state.jupiter.vector_time().remote;
            let Some(buffered) = state.reorder.take(next) else {
                break;
            };
            render(&self.apply(&mut state, &buffered)?);
            rendered += 1;
        }
        Ok(rendered)
    }

    /// Compute and send the undo of the newest local edit.
    ///
    /// `Ok(None)` when there is nothing to undo. The returned request's
    /// operation must also be applied to the local buffer.
    pub fn undo_with<E, F>(&self, document: DocumentId, send: F) -> Result<Option<Request>, E>
    where
        E: From<JupiterError>,
        F: FnOnce(&Request) -> Result<(), E>,
    {
        self.revert_with(document, send, |undo| undo.plan_undo(document))
    }

    /// Compute and send the redo of the newest undo.
    pub fn redo_with<E, F>(&self, document: DocumentId, send: F) -> Result<Option<Request>, E>
    where
        E: From<JupiterError>,
        F: FnOnce(&Request) -> Result<(), E>,
    {
        self.revert_with(document, send, |undo| undo.plan_redo(document))
    }

    pub fn undo(&self, document: DocumentId) -> Result<Option<Request>, JupiterError> {
        self.undo_with(document, |_| Ok::<_, JupiterError>(()))
    }

    pub fn redo(&self, document: DocumentId) -> Result<Option<Request>, JupiterError> {
        self.redo_with(document, |_| Ok::<_, JupiterError>(()))
    }

    /// Whether a host checksum describes this document's current state.
    pub fn checksum_is_current(&self, activity: &ChecksumActivity) -> Result<bool, JupiterError> {
        let shared = self.document(activity.document)?;
        let state = shared.lock();
        Ok(Self::is_current(&state, activity))
    }

    /// Compare a host checksum against `content()` taken under the document
    /// lock. `None` when the checksum is stale or no content is available.
    pub fn verify_checksum<F>(&self, activity: &ChecksumActivity, content: F) -> Result<Option<bool>, JupiterError>
    where
        F: FnOnce() -> Option<String>,
    {
        let shared = self.document(activity.document)?;
        let state = shared.lock();
        if !Self::is_current(&state, activity) {
            return Ok(None);
        }
        Ok(content().map(|content| activity.checksum.matches(&content)))
    }

    fn is_current(state: &ClientDocument, activity: &ChecksumActivity) -> bool {
        match activity.time {
            Some(time) => state.jupiter.is_current(time),
            None => state.jupiter.outstanding_len() == 0,
        }
    }

    fn revert_with<E, F, C>(&self, document: DocumentId, send: F, plan: C) -> Result<Option<Request>, E>
    where
        E: From<JupiterError>,
        F: FnOnce(&Request) -> Result<(), E>,
        C: FnOnce(&UndoManager) -> Option<Revert>,
    {
        let shared = self.document(document)?;
        self.ensure_open(document)?;

        let mut state = shared.lock();
        let Some(revert) = plan(&self.undo) else {
            return Ok(None);
        };
        if revert.operation().is_noop() {
            // Remote edits already erased everything this would revert.
            self.undo.commit(document, revert);
            return Ok(None);
        }
        let request = state
            .jupiter
            .generate(revert.operation().clone(), self.local_site);
        if let Err(err) = send(&request) {
            state.jupiter.retract();
            return Err(err);
        }
        self.undo.commit(document, revert);
        Ok(Some(request))
    }

    fn apply(&self, state: &mut ClientDocument, request: &Request) -> Result<Operation, JupiterError> {
        let operation = state.jupiter.receive(request)?;
        self.undo
            .add(request.document, EntryType::Remote, operation.clone());
        Ok(operation)
    }

    fn ensure_open(&self, document: DocumentId) -> Result<(), JupiterError> {
        if self.gate.is_blocked() {
            return Err(JupiterError::Blocked(document));
        }
        Ok(())
    }

    fn document(&self, document: DocumentId) -> Result<Arc<Mutex<ClientDocument>>, JupiterError> {
        self.documents
            .read()
            .get(&document)
            .cloned()
            .ok_or(JupiterError::UnknownDocument(document))
    }
}
