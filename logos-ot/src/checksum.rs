//! Document checksums for the consistency watchdog.
//!
//! A checksum is only meaningful when both sides describe the same logical
//! instant, so the host stamps it with the Jupiter vector time of the
//! (document, site) proxy it was computed against. The guest compares the
//! content only when its own state is at that instant.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::jupiter::{DocumentId, VectorTime};
use crate::operation::char_len;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Length (in chars) and CRC-32C of a document's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentChecksum {
    pub length: usize,
    pub hash: u32,
}

impl DocumentChecksum {
    pub fn of(content: &str) -> Self {
        Self {
            length: char_len(content),
            hash: CASTAGNOLI.checksum(content.as_bytes()),
        }
    }

    pub fn matches(&self, content: &str) -> bool {
        *self == Self::of(content)
    }
}

/// A checksum as sent from the host to a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumActivity {
    pub document: DocumentId,
    pub checksum: DocumentChecksum,
    /// Host-side vector time of the (document, guest) pair. `None` for
    /// checksums not tied to a Jupiter state.
    pub time: Option<VectorTime>,
}

impl ChecksumActivity {
    pub fn new(document: DocumentId, checksum: DocumentChecksum) -> Self {
        Self {
            document,
            checksum,
            time: None,
        }
    }

    pub fn with_time(mut self, time: VectorTime) -> Self {
        self.time = Some(time);
        self
    }
}
