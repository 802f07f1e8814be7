//! # logos-ot: Jupiter concurrency engine for collaborative text editing
//!
//! Keeps every site's copy of a shared document identical under concurrent
//! edits, using the Jupiter client/server operational transformation scheme.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    Edit (Request)    ┌──────────────────────────┐
//! │ DocumentClient   │ ───────────────────► │ DocumentServer (host)    │
//! │ (one per site)   │ ◄─────────────────── │ one Jupiter pair / site  │
//! └────────┬─────────┘    Relay (Request)   └──────────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐                      ┌──────────────────────────┐
//! │ UndoManager      │                      │ StopManager              │
//! │ (history, undo)  │                      │ (freeze / resume users)  │
//! └──────────────────┘                      └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert / Delete / NoOperation / Split text operations
//! - [`transform`]: Inclusion transformation with host-wins tie-break
//! - [`jupiter`]: Two-party vector-time state and causality checks
//! - [`client`]: Per-document client state with reorder buffer
//! - [`server`]: Per-document sequencer relaying to every other site
//! - [`history`] / [`undo`]: Bounded history and undo/redo across remote edits
//! - [`stop`]: Stop/start handshake with single-use start handles
//! - [`checksum`]: CRC-32C document checksums stamped with vector time
//! - [`protocol`]: Activities, bincode envelopes, the transport seam
//! - [`session`]: Session context wiring it all together
//! - [`config`] / [`progress`]: Tunables and cancellable progress

pub mod checksum;
pub mod client;
pub mod config;
pub mod history;
pub mod jupiter;
pub mod operation;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stop;
pub mod transform;
pub mod undo;

// Re-exports for convenience
pub use checksum::{ChecksumActivity, DocumentChecksum};
pub use client::{ConcurrentDocumentClient, EditGate, ReorderBuffer};
pub use config::{ConfigError, SessionConfig};
pub use history::{EditorHistoryEntry, EntryType, OperationHistory, DEFAULT_HISTORY_LIMIT};
pub use jupiter::{
    DocumentId, JupiterDocumentState, JupiterError, Request, SiteId, SiteRole, VectorTime,
};
pub use operation::{Operation, OperationError};
pub use progress::{CancellationToken, LogProgress, ProgressMonitor};
pub use protocol::{Activity, ChannelTransport, Envelope, ProtocolError, Transport};
pub use server::{ConcurrentDocumentServer, RelayMap, ServerStats};
pub use session::{EditorBinding, Session, SessionError, User};
pub use stop::{
    Blockable, StartHandle, StartHandleState, StopActivity, StopError, StopKind, StopManager,
    StopState,
};
pub use transform::{include, transform};
pub use undo::{Revert, UndoManager};
