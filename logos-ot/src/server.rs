//! Host-side sequencer: N two-party Jupiter pairs per document.
//!
//! Architecture:
//! ```text
//! Site A ──┐                                   ┌──► Site B (proxy B generates)
//!           ├── Room (doc_id) ── proxy A receives
//! Site B ──┘        one critical section       └──► Site C (proxy C generates)
//! ```
//!
//! Each document room holds one server-role [`JupiterDocumentState`] per
//! registered site. An incoming request is received on its origin's proxy,
//! which yields the operation in server order, and is then generated on every
//! other proxy. The whole step runs under the room's mutex, which gives every
//! document a single total order; distinct documents proceed concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checksum::{ChecksumActivity, DocumentChecksum};
use crate::jupiter::{DocumentId, JupiterDocumentState, JupiterError, Request, SiteId, SiteRole};

/// Relay requests keyed by destination site.
pub type RelayMap = BTreeMap<SiteId, Request>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub processed_requests: u64,
    pub relayed_requests: u64,
    pub registered_pairs: usize,
    pub active_documents: usize,
}

/// Counters touched on every request, kept lock-free.
#[derive(Default)]
struct AtomicServerStats {
    processed_requests: AtomicU64,
    relayed_requests: AtomicU64,
}

struct DocumentRoom {
    proxies: BTreeMap<SiteId, JupiterDocumentState>,
    /// Requests sequenced so far.
    sequence: u64,
}

impl DocumentRoom {
    fn new() -> Self {
        Self {
            proxies: BTreeMap::new(),
            sequence: 0,
        }
    }
}

pub struct ConcurrentDocumentServer {
    rooms: RwLock<HashMap<DocumentId, Arc<Mutex<DocumentRoom>>>>,
    stats: AtomicServerStats,
}

impl Default for ConcurrentDocumentServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentDocumentServer {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicServerStats::default(),
        }
    }

    /// Create the (document, site) pair. Returns `false` if it already exists.
    pub fn register_site(&self, document: DocumentId, site: SiteId) -> bool {
        let mut rooms = self.rooms.write();
        let room = rooms
            .entry(document)
            .or_insert_with(|| Arc::new(Mutex::new(DocumentRoom::new())));
        let mut room = room.lock();
        if room.proxies.contains_key(&site) {
            return false;
        }
        room.proxies
            .insert(site, JupiterDocumentState::new(document, SiteRole::Server));
        log::debug!("server: registered {site} on {document}");
        true
    }

    /// Drop the (document, site) pair; the room goes away with its last site.
    pub fn unregister_site(&self, document: DocumentId, site: SiteId) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get(&document) else {
            return false;
        };
        let (removed, empty) = {
            let mut room = room.lock();
            let removed = room.proxies.remove(&site).is_some();
            (removed, room.proxies.is_empty())
        };
        if empty {
            rooms.remove(&document);
            log::debug!("server: closed room {document}");
        }
        if removed {
            log::debug!("server: unregistered {site} from {document}");
        }
        removed
    }

    /// Remove `site` from every document. Returns the documents it left.
    pub fn unregister_everywhere(&self, site: SiteId) -> Vec<DocumentId> {
        let documents: Vec<_> = self.rooms.read().keys().copied().collect();
        documents
            .into_iter()
            .filter(|document| self.unregister_site(*document, site))
            .collect()
    }

    /// Replace the pair's state with a fresh one after a recovery.
    pub fn reset(&self, document: DocumentId, site: SiteId) -> Result<(), JupiterError> {
        let room = self.room(document)?;
        let mut room = room.lock();
        let proxy = room
            .proxies
            .get_mut(&site)
            .ok_or(JupiterError::UnknownSite { document, site })?;
        *proxy = JupiterDocumentState::new(document, SiteRole::Server);
        log::info!("server: reset {site} on {document}");
        Ok(())
    }

    /// Sites registered for `document`, in id order.
    pub fn sites(&self, document: DocumentId) -> Vec<SiteId> {
        let Ok(room) = self.room(document) else {
            return Vec::new();
        };
        let sites = room.lock().proxies.keys().copied().collect();
        sites
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        self.rooms.read().keys().copied().collect()
    }

    /// Sequence a request and compute what every other site must receive.
    pub fn handle_incoming(&self, request: &Request) -> Result<RelayMap, JupiterError> {
        let mut relays = RelayMap::new();
        self.handle_incoming_with(request, |site, relay| {
            relays.insert(site, relay);
            Ok::<_, JupiterError>(())
        })?;
        Ok(relays)
    }

    /// Like [`handle_incoming`](Self::handle_incoming), handing each relay to
    /// `deliver` inside the room's critical section so relays leave in
    /// sequence order. Returns the number of relays.
    ///
    /// Every proxy is advanced before the first delivery. A failed delivery
    /// does not stop the others; the first error is returned after all were
    /// attempted.
    pub fn handle_incoming_with<E, F>(&self, request: &Request, mut deliver: F) -> Result<usize, E>
    where
        E: From<JupiterError>,
        F: FnMut(SiteId, Request) -> Result<(), E>,
    {
        let document = request.document;
        let room = self.room(document)?;
        let mut guard = room.lock();
        let room = &mut *guard;

        let proxy = room
            .proxies
            .get_mut(&request.origin)
            .ok_or(JupiterError::UnknownSite {
                document,
                site: request.origin,
            })?;
        let operation = proxy.receive(request)?;
        room.sequence += 1;
        self.stats.processed_requests.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "server: {document} #{} from {} at {}",
            room.sequence,
            request.origin,
            request.time
        );

        let relays: Vec<(SiteId, Request)> = room
            .proxies
            .iter_mut()
            .filter(|(site, _)| **site != request.origin)
            .map(|(site, proxy)| (*site, proxy.generate(operation.clone(), request.origin)))
            .collect();

        let relayed = relays.len();
        let mut first_error = None;
        for (site, relay) in relays {
            if let Err(err) = deliver(site, relay) {
                log::warn!("server: relay of {document} to {site} failed");
                first_error.get_or_insert(err);
            }
        }
        self.stats
            .relayed_requests
            .fetch_add(relayed as u64, Ordering::Relaxed);
        match first_error {
            Some(err) => Err(err),
            None => Ok(relayed),
        }
    }

    /// Stamp a checksum with the pair's vector time.
    pub fn stamp_checksum(
        &self,
        document: DocumentId,
        site: SiteId,
        checksum: DocumentChecksum,
    ) -> Result<ChecksumActivity, JupiterError> {
        let room = self.room(document)?;
        let room = room.lock();
        let proxy = room
            .proxies
            .get(&site)
            .ok_or(JupiterError::UnknownSite { document, site })?;
        Ok(ChecksumActivity::new(document, checksum).with_time(proxy.vector_time()))
    }

    pub fn stats(&self) -> ServerStats {
        let rooms = self.rooms.read();
        ServerStats {
            processed_requests: self.stats.processed_requests.load(Ordering::Relaxed),
            relayed_requests: self.stats.relayed_requests.load(Ordering::Relaxed),
            registered_pairs: rooms.values().map(|room| room.lock().proxies.len()).sum(),
            active_documents: rooms.len(),
        }
    }

    fn room(&self, document: DocumentId) -> Result<Arc<Mutex<DocumentRoom>>, JupiterError> {
        self.rooms
            .read()
            .get(&document)
            .cloned()
            .ok_or(JupiterError::UnknownDocument(document))
    }
}
