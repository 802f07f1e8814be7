//! Activities exchanged between sites and the transport seam.
//!
//! Wire format (bincode-encoded `Envelope`):
//! ```text
//! ┌───────────┬─────────────┬──────────────────────────────┐
//! │ source    │ destination │ activity                     │
//! │ uuid      │ uuid        │ tag + payload (variable)     │
//! └───────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! Routing of Jupiter traffic:
//! ```text
//!  guest client ──Edit──► host server ──Relay──► other clients
//!  host client  ──Edit──► host server            (self-addressed)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::checksum::ChecksumActivity;
use crate::jupiter::{DocumentId, Request, SiteId};
use crate::stop::StopActivity;

/// Everything one site can tell another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    /// Client → server: a locally generated request.
    Edit(Request),
    /// Server → client: a sequenced and transformed request.
    Relay(Request),
    /// Host → guest: checksum of the host's copy.
    Checksum(ChecksumActivity),
    /// Guest → host: a current checksum did not match the guest's copy.
    ChecksumMismatch { document: DocumentId },
    /// Stop/start handshake.
    Stop(StopActivity),
}

impl Activity {
    pub fn document(&self) -> Option<DocumentId> {
        match self {
            Activity::Edit(request) | Activity::Relay(request) => Some(request.document),
            Activity::Checksum(checksum) => Some(checksum.document),
            Activity::ChecksumMismatch { document } => Some(*document),
            Activity::Stop(_) => None,
        }
    }
}

/// An activity addressed from one site to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: SiteId,
    pub destination: SiteId,
    pub activity: Activity,
}

impl Envelope {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("no route to site {0}")]
    UnknownDestination(SiteId),
}

/// Delivers activities to sites.
///
/// Implementations must deliver in order and exactly once per
/// (source, destination) pair. The destination may be the local site: the
/// host's own client and server talk through the transport too, which keeps
/// their locks from ever nesting.
pub trait Transport: Send + Sync {
    fn send(&self, destination: SiteId, activity: Activity) -> Result<(), ProtocolError>;
}

/// Transport that pushes envelopes into a tokio channel.
///
/// A router task on the other end decodes the destination and hands the
/// activity to that site's session.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    source: SiteId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its envelopes arrive on.
    pub fn new(source: SiteId) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { source, tx }, rx)
    }

    /// Share an existing channel, e.g. one router for every site.
    pub fn with_sender(source: SiteId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { source, tx }
    }

    pub fn source(&self) -> SiteId {
        self.source
    }
}

impl Transport for ChannelTransport {
    fn send(&self, destination: SiteId, activity: Activity) -> Result<(), ProtocolError> {
        self.tx
            .send(Envelope {
                source: self.source,
                destination,
                activity,
            })
            .map_err(|_| ProtocolError::ChannelClosed)
    }
}
