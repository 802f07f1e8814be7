//! Two-party Jupiter state for one document.
//!
//! Each side of a client/server pair keeps a [`VectorTime`] and a queue of
//! operations it generated that the peer has not yet acknowledged:
//!
//! ```text
//!   client                                 server proxy
//! ┌───────────────────────┐   Request    ┌───────────────────────┐
//! │ local:  ops sent      │ ───────────► │ remote: ops received  │
//! │ remote: ops received  │ ◄─────────── │ local:  ops sent      │
//! │ outstanding: [op,..]  │   Request    │ outstanding: [op,..]  │
//! └───────────────────────┘              └───────────────────────┘
//! ```
//!
//! An incoming operation was generated before the peer saw our outstanding
//! operations, so it is transformed against each of them in order, and each
//! of them against it, before it is applied.
//!
//! Reference: Nichols et al., "High-Latency, Low-Bandwidth Windowing in the
//! Jupiter Collaboration System", UIST 1995

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::Operation;
use crate::transform::transform;

/// Identity of a participating site.
pub type SiteId = Uuid;

/// Identity of a shared document.
pub type DocumentId = Uuid;

/// Errors raised by the Jupiter engine and the roles built on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JupiterError {
    /// The peer's timing does not fit this state. Replicas have diverged.
    #[error("causality violation on document {document}: {detail}")]
    CausalityViolation { document: DocumentId, detail: String },
    #[error("document {0} is not shared")]
    UnknownDocument(DocumentId),
    #[error("site {site} is not registered for document {document}")]
    UnknownSite { document: DocumentId, site: SiteId },
    #[error("local edits on document {0} are blocked")]
    Blocked(DocumentId),
}

impl JupiterError {
    /// Whether the session can no longer guarantee convergence.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JupiterError::CausalityViolation { .. })
    }
}

/// Operation counts of one side of a Jupiter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VectorTime {
    /// Operations this side generated.
    pub local: u64,
    /// Operations this side received from its peer.
    pub remote: u64,
}

impl VectorTime {
    pub fn new(local: u64, remote: u64) -> Self {
        Self { local, remote }
    }

    /// The same instant as seen from the peer.
    pub fn mirrored(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl std::fmt::Display for VectorTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.local, self.remote)
    }
}

/// An operation stamped with the sender's vector time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub document: DocumentId,
    /// Site whose user authored the edit. Relayed requests keep the author.
    pub origin: SiteId,
    pub time: VectorTime,
    pub operation: Operation,
}

/// Which end of the pair this state is. The server's operations win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRole {
    Client,
    Server,
}

impl SiteRole {
    /// Whether an operation arriving from the peer lands first on a tie.
    fn incoming_first(self) -> bool {
        matches!(self, SiteRole::Client)
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    operation: Operation,
    /// Our local count when this operation was generated.
    local_count: u64,
}

/// Jupiter state for one (document, peer) relationship.
#[derive(Debug, Clone)]
pub struct JupiterDocumentState {
    document: DocumentId,
    role: SiteRole,
    time: VectorTime,
    outstanding: VecDeque<Outstanding>,
}

impl JupiterDocumentState {
    pub fn new(document: DocumentId, role: SiteRole) -> Self {
        Self {
            document,
            role,
            time: VectorTime::default(),
            outstanding: VecDeque::new(),
        }
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn role(&self) -> SiteRole {
        self.role
    }

    pub fn vector_time(&self) -> VectorTime {
        self.time
    }

    /// Operations sent to the peer and not yet acknowledged.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Stamp `operation` for sending to the peer and remember it until acknowledged.
    pub fn generate(&mut self, operation: Operation, origin: SiteId) -> Request {
        let request = Request {
            document: self.document,
            origin,
            time: self.time,
            operation: operation.clone(),
        };
        self.outstanding.push_back(Outstanding {
            operation,
            local_count: self.time.local,
        });
        self.time.local += 1;
        log::trace!("jupiter {} generated at {}", self.document, request.time);
        request
    }

    /// Take back the most recent [`generate`](Self::generate) after its
    /// request failed to leave this site.
    ///
    /// Only valid while nothing was received since that call.
    pub(crate) fn retract(&mut self) -> Option<Operation> {
        let entry = self.outstanding.pop_back()?;
        self.time.local -= 1;
        log::trace!("jupiter {} retracted back to {}", self.document, self.time);
        Some(entry.operation)
    }

    /// Whether `request` is the next one the peer generated.
    ///
    /// A request from further ahead is premature and may be buffered by the
    /// caller. Anything else is reported by [`receive`](Self::receive).
    pub fn is_premature(&self, request: &Request) -> bool {
        request.time.local > self.time.remote
    }

    /// Transform a peer's request into an operation applicable to our state.
    pub fn receive(&mut self, request: &Request) -> Result<Operation, JupiterError> {
        self.check_preconditions(request.time)?;
        if !request.operation.is_addressable() {
            return Err(self.violation(format!(
                "operation #{} addresses past the end of any buffer",
                request.time.local
            )));
        }
        self.discard_acknowledged(request.time.remote);

        let incoming_first = self.role.incoming_first();
        let mut incoming = request.operation.clone();
        for entry in self.outstanding.iter_mut() {
            let (next, queued) = transform(&incoming, &entry.operation, incoming_first);
            entry.operation = queued;
            incoming = next;
        }

        self.time.remote += 1;
        log::trace!(
            "jupiter {} received {} now at {} ({} outstanding)",
            self.document,
            request.time,
            self.time,
            self.outstanding.len()
        );
        Ok(incoming)
    }

    /// Whether a vector time stamped by the peer names our current instant.
    pub fn is_current(&self, peer_time: VectorTime) -> bool {
        peer_time.mirrored() == self.time
    }

    fn check_preconditions(&self, time: VectorTime) -> Result<(), JupiterError> {
        if time.local != self.time.remote {
            return Err(self.violation(format!(
                "expected peer operation #{} but received #{}",
                self.time.remote, time.local
            )));
        }
        if time.remote > self.time.local {
            return Err(self.violation(format!(
                "peer acknowledges {} operations but only {} were sent",
                time.remote, self.time.local
            )));
        }
        if let Some(oldest) = self.outstanding.front() {
            if time.remote < oldest.local_count {
                return Err(self.violation(format!(
                    "peer acknowledges {} operations but {} were already acknowledged",
                    time.remote, oldest.local_count
                )));
            }
        }
        Ok(())
    }

    fn discard_acknowledged(&mut self, acknowledged: u64) {
        while self
            .outstanding
            .front()
            .is_some_and(|entry| entry.local_count < acknowledged)
        {
            self.outstanding.pop_front();
        }
    }

    fn violation(&self, detail: String) -> JupiterError {
        JupiterError::CausalityViolation {
            document: self.document,
            detail,
        }
    }
}
