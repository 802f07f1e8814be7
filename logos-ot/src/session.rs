//! One collaboration session: the context object owning every manager.
//!
//! ```text
//!               local_edit_produced / undo / redo
//!                            │
//!                            ▼
//!  EditorBinding ◄── ConcurrentDocumentClient ──Edit──► Transport ──► host
//!   (render)               ▲                                          │
//!                          └──────────── Relay ◄── ConcurrentDocumentServer
//!                                                       (host only)
//! ```
//!
//! Sessions are created at session start and disposed at session end; no
//! state outlives them. The host's client talks to its own server through
//! the transport like any guest does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::checksum::{ChecksumActivity, DocumentChecksum};
use crate::client::ConcurrentDocumentClient;
use crate::config::SessionConfig;
use crate::jupiter::{DocumentId, JupiterError, Request, SiteId};
use crate::operation::Operation;
use crate::progress::ProgressMonitor;
use crate::protocol::{Activity, ProtocolError, Transport};
use crate::server::ConcurrentDocumentServer;
use crate::stop::{StartHandle, StopError, StopManager};
use crate::undo::UndoManager;

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: SiteId,
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// The editor side of a shared document.
///
/// Callbacks run while the document is locked. Edits the editor reports via
/// [`Session::local_edit_produced`] must reach the session in buffer order,
/// with no callback rendered in between.
pub trait EditorBinding: Send + Sync {
    /// Apply an edit made elsewhere.
    fn remote_edit_ready(&self, document: DocumentId, operation: &Operation);

    /// Apply a local undo or redo.
    fn revert_ready(&self, document: DocumentId, operation: &Operation);

    /// Current buffer content, used to verify host checksums.
    fn content(&self, _document: DocumentId) -> Option<String> {
        None
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Jupiter(#[from] JupiterError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error("session terminated: {0}")]
    Terminated(JupiterError),
    #[error("only the host can do this")]
    NotHost,
    #[error("request from {source_site} claims origin {origin}")]
    OriginMismatch { source_site: SiteId, origin: SiteId },
}

pub struct Session {
    config: SessionConfig,
    local: User,
    host: SiteId,
    participants: RwLock<BTreeMap<SiteId, User>>,
    undo: Arc<UndoManager>,
    client: ConcurrentDocumentClient,
    server: Option<ConcurrentDocumentServer>,
    stop_manager: StopManager,
    transport: Arc<dyn Transport>,
    editor: Arc<dyn EditorBinding>,
    fatal: Mutex<Option<JupiterError>>,
    /// Host only: documents guests reported as diverged.
    inconsistencies: Mutex<BTreeMap<DocumentId, BTreeSet<SiteId>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        local: User,
        host: SiteId,
        transport: Arc<dyn Transport>,
        editor: Arc<dyn EditorBinding>,
    ) -> Self {
        let undo = Arc::new(UndoManager::new(config.history_limit));
        let client =
            ConcurrentDocumentClient::new(local.id, undo.clone(), config.max_buffered_requests);
        let stop_manager = StopManager::new(
            local.id,
            transport.clone(),
            config.stop_timeout(),
            config.start_timeout(),
        );
        stop_manager.add_blockable(client.gate());

        let is_host = local.id == host;
        let server = is_host.then(ConcurrentDocumentServer::new);
        log::info!(
            "session started as {} ({})",
            local.name,
            if is_host { "host" } else { "guest" }
        );

        let mut participants = BTreeMap::new();
        participants.insert(local.id, local.clone());

        Self {
            config,
            local,
            host,
            participants: RwLock::new(participants),
            undo,
            client,
            server,
            stop_manager,
            transport,
            editor,
            fatal: Mutex::new(None),
            inconsistencies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_user(&self) -> &User {
        &self.local
    }

    pub fn host(&self) -> SiteId {
        self.host
    }

    pub fn is_host(&self) -> bool {
        self.server.is_some()
    }

    pub fn client(&self) -> &ConcurrentDocumentClient {
        &self.client
    }

    pub fn server(&self) -> Option<&ConcurrentDocumentServer> {
        self.server.as_ref()
    }

    pub fn stop_manager(&self) -> &StopManager {
        &self.stop_manager
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn add_participant(&self, user: User) {
        log::info!("{} joined", user.name);
        self.participants.write().insert(user.id, user);
    }

    /// Forget a participant everywhere: server pairs, stop locks, reports.
    pub fn remove_participant(&self, site: SiteId) -> Option<User> {
        let user = self.participants.write().remove(&site)?;
        if let Some(server) = &self.server {
            let left = server.unregister_everywhere(site);
            log::debug!("{} left {} document(s)", user.name, left.len());
        }
        self.stop_manager.remove_user(site);
        for sites in self.inconsistencies.lock().values_mut() {
            sites.remove(&site);
        }
        log::info!("{} left", user.name);
        Some(user)
    }

    pub fn participants(&self) -> Vec<User> {
        self.participants.read().values().cloned().collect()
    }

    pub fn remote_participants(&self) -> Vec<SiteId> {
        self.participants
            .read()
            .keys()
            .copied()
            .filter(|site| *site != self.local.id)
            .collect()
    }

    /// Start collaborating on `document`. On the host, `sites` are the
    /// guests sharing it; guests pass no sites.
    pub fn share_document(&self, document: DocumentId, sites: &[SiteId]) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.client.add_document(document);
        if let Some(server) = &self.server {
            server.register_site(document, self.local.id);
            for site in sites {
                server.register_site(document, *site);
            }
        }
        Ok(())
    }

    pub fn unshare_document(&self, document: DocumentId) {
        self.client.remove_document(document);
        if let Some(server) = &self.server {
            for site in server.sites(document) {
                server.unregister_site(document, site);
            }
        }
        self.inconsistencies.lock().remove(&document);
    }

    /// Report an edit the local editor already applied to its buffer.
    pub fn local_edit_produced(&self, document: DocumentId, operation: Operation) -> Result<(), SessionError> {
        self.ensure_running()?;
        let result = self
            .client
            .handle_local_edit_with(document, operation, |request| self.submit(request));
        self.escalate(result).map(|_| ())
    }

    /// Undo the newest local edit. The editor renders it via
    /// [`EditorBinding::revert_ready`]; the operation is returned as well.
    pub fn undo(&self, document: DocumentId) -> Result<Option<Operation>, SessionError> {
        self.ensure_running()?;
        let result = self.client.undo_with(document, |request| self.revert(request));
        Ok(self.escalate(result)?.map(|request| request.operation))
    }

    pub fn redo(&self, document: DocumentId) -> Result<Option<Operation>, SessionError> {
        self.ensure_running()?;
        let result = self.client.redo_with(document, |request| self.revert(request));
        Ok(self.escalate(result)?.map(|request| request.operation))
    }

    /// Handle an activity delivered by the transport.
    pub fn receive(&self, source: SiteId, activity: Activity) -> Result<(), SessionError> {
        match activity {
            Activity::Edit(request) => {
                self.ensure_running()?;
                self.sequence(source, request)
            }
            Activity::Relay(request) => {
                self.ensure_running()?;
                self.render(request)
            }
            Activity::Checksum(checksum) => {
                self.ensure_running()?;
                self.verify_checksum(source, checksum)
            }
            Activity::ChecksumMismatch { document } => {
                log::warn!("{source} reports {document} diverged");
                self.inconsistencies
                    .lock()
                    .entry(document)
                    .or_default()
                    .insert(source);
                Ok(())
            }
            Activity::Stop(stop) => Ok(self.stop_manager.handle_activity(source, stop)?),
        }
    }

    /// Freeze one user, or every remote participant when `user` is `None`.
    pub async fn stop(
        &self,
        user: Option<SiteId>,
        cause: &str,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<StartHandle>, SessionError> {
        let users = match user {
            Some(user) => vec![user],
            None => self.remote_participants(),
        };
        Ok(self.stop_manager.stop(&users, cause, monitor).await?)
    }

    /// Host: send `site` a checksum of `content`, the host's copy of
    /// `document`. Returns `false` without sending while the host's own
    /// client still lags the server order.
    pub fn send_checksum(&self, document: DocumentId, site: SiteId, content: &str) -> Result<bool, SessionError> {
        let server = self.server.as_ref().ok_or(SessionError::NotHost)?;
        let checksum = DocumentChecksum::of(content);
        let own = server.stamp_checksum(document, self.local.id, checksum)?;
        if !self.client.checksum_is_current(&own)? {
            return Ok(false);
        }
        let activity = server.stamp_checksum(document, site, checksum)?;
        self.transport.send(site, Activity::Checksum(activity))?;
        Ok(true)
    }

    /// Host: diverged documents reported since the last call.
    pub fn take_inconsistencies(&self) -> BTreeMap<DocumentId, BTreeSet<SiteId>> {
        std::mem::take(&mut *self.inconsistencies.lock())
    }

    /// Restart the local Jupiter state of `document` after its content was
    /// overwritten by a recovery.
    pub fn reset_document(&self, document: DocumentId) -> Result<(), SessionError> {
        Ok(self.client.reset(document)?)
    }

    /// Host: restart the pair for `site` after recovering its copy.
    pub fn reset_site(&self, document: DocumentId, site: SiteId) -> Result<(), SessionError> {
        let server = self.server.as_ref().ok_or(SessionError::NotHost)?;
        server.reset(document, site)?;
        if let Some(sites) = self.inconsistencies.lock().get_mut(&document) {
            sites.remove(&site);
        }
        Ok(())
    }

    /// The causality violation that terminated the session, if any.
    pub fn fatal_error(&self) -> Option<JupiterError> {
        self.fatal.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Tear down at session end.
    pub fn dispose(&self) {
        self.stop_manager.dispose();
        for document in self.client.documents() {
            self.unshare_document(document);
        }
        log::info!("session of {} disposed", self.local.name);
    }

    fn submit(&self, request: &Request) -> Result<(), SessionError> {
        self.transport
            .send(self.host, Activity::Edit(request.clone()))?;
        Ok(())
    }

    fn revert(&self, request: &Request) -> Result<(), SessionError> {
        self.editor.revert_ready(request.document, &request.operation);
        self.submit(request)
    }

    fn sequence(&self, source: SiteId, request: Request) -> Result<(), SessionError> {
        let server = self.server.as_ref().ok_or(SessionError::NotHost)?;
        if request.origin != source {
            return Err(SessionError::OriginMismatch {
                source_site: source,
                origin: request.origin,
            });
        }
        let result: Result<usize, SessionError> = server.handle_incoming_with(&request, |site, relay| {
            self.transport.send(site, Activity::Relay(relay))?;
            Ok::<(), SessionError>(())
        });
        self.escalate(result).map(|_| ())
    }

    fn render(&self, request: Request) -> Result<(), SessionError> {
        let document = request.document;
        let result = self
            .client
            .receive_remote_operation_with(&request, |operation| {
                self.editor.remote_edit_ready(document, operation);
            })
            .map_err(SessionError::from);
        self.escalate(result).map(|_| ())
    }

    fn verify_checksum(&self, source: SiteId, activity: ChecksumActivity) -> Result<(), SessionError> {
        let document = activity.document;
        let verdict = self
            .client
            .verify_checksum(&activity, || self.editor.content(document))?;
        match verdict {
            Some(false) => {
                log::warn!("checksum mismatch on {document}");
                self.transport
                    .send(source, Activity::ChecksumMismatch { document })?;
            }
            Some(true) => log::trace!("checksum of {document} verified"),
            None => log::trace!("skipped stale checksum of {document}"),
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match self.fatal.lock().as_ref() {
            Some(err) => Err(SessionError::Terminated(err.clone())),
            None => Ok(()),
        }
    }

    /// Record causality violations; the session cannot continue after one.
    fn escalate<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(SessionError::Jupiter(err)) = &result {
            if err.is_fatal() {
                log::error!("session terminated: {err}");
                self.fatal.lock().get_or_insert_with(|| err.clone());
            }
        }
        result
    }
}
