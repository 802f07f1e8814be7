//! Immutable text edit descriptions.
//!
//! An [`Operation`] describes one edit against a text buffer. Offsets and
//! lengths count Unicode scalar values, never bytes, so every site computes
//! identical positions regardless of encoding.
//!
//! ```text
//! Insert { offset, text }   ── put `text` at `offset`
//! Delete { offset, text }   ── remove `text` found at `offset`
//! NoOperation               ── identity
//! Split(first, second)      ── `first`, then `second` in the resulting state
//! ```
//!
//! Deletes carry the removed text so that [`Operation::invert`] never needs
//! the buffer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to apply an operation to a concrete buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("offset {offset} out of bounds for buffer of length {len}")]
    OutOfBounds { offset: usize, len: usize },
    #[error("delete at {offset} expected {expected:?} but buffer holds {found:?}")]
    TextMismatch {
        offset: usize,
        expected: String,
        found: String,
    },
}

/// A single edit, or an ordered pair of edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert { offset: usize, text: String },
    Delete { offset: usize, text: String },
    #[default]
    NoOperation,
    Split(Box<Operation>, Box<Operation>),
}

impl Operation {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            offset,
            text: text.into(),
        }
    }

    pub fn delete(offset: usize, text: impl Into<String>) -> Self {
        Operation::Delete {
            offset,
            text: text.into(),
        }
    }

    /// `first` followed by `second`, where `second` is expressed in the
    /// state produced by `first`.
    pub fn split(first: Operation, second: Operation) -> Self {
        Operation::Split(Box::new(first), Box::new(second))
    }

    /// Whether applying this operation leaves every buffer unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::NoOperation => true,
            Operation::Insert { text, .. } | Operation::Delete { text, .. } => text.is_empty(),
            Operation::Split(first, second) => first.is_noop() && second.is_noop(),
        }
    }

    /// The operation that undoes this one when applied right after it.
    pub fn invert(&self) -> Operation {
        match self {
            Operation::Insert { offset, text } => Operation::delete(*offset, text.clone()),
            Operation::Delete { offset, text } => Operation::insert(*offset, text.clone()),
            Operation::NoOperation => Operation::NoOperation,
            Operation::Split(first, second) => Operation::split(second.invert(), first.invert()),
        }
    }

    /// The operation equivalent to `self` followed by `next`.
    ///
    /// `NoOperation` is the identity on both sides.
    pub fn compose(self, next: Operation) -> Operation {
        if self.is_noop() {
            next
        } else if next.is_noop() {
            self
        } else {
            Operation::split(self, next)
        }
    }

    /// Whether every `offset + len` of this operation fits in a `usize`.
    pub fn is_addressable(&self) -> bool {
        match self {
            Operation::Insert { offset, text } | Operation::Delete { offset, text } => {
                offset.checked_add(char_len(text)).is_some()
            }
            Operation::NoOperation => true,
            Operation::Split(first, second) => first.is_addressable() && second.is_addressable(),
        }
    }

    /// Net change in buffer length, in chars.
    pub fn length_delta(&self) -> isize {
        match self {
            Operation::Insert { text, .. } => char_len(text) as isize,
            Operation::Delete { text, .. } => -(char_len(text) as isize),
            Operation::NoOperation => 0,
            Operation::Split(first, second) => first.length_delta() + second.length_delta(),
        }
    }

    /// Primitive inserts and deletes in application order, no-ops removed.
    ///
    /// Editor bindings render these one at a time.
    pub fn flatten(&self) -> Vec<Operation> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<Operation>) {
        match self {
            Operation::Split(first, second) => {
                first.flatten_into(out);
                second.flatten_into(out);
            }
            op if op.is_noop() => {}
            op => out.push(op.clone()),
        }
    }

    /// Apply this operation to `buffer` in place.
    ///
    /// A failed split may leave its first half applied; callers treat any
    /// error here as a desynchronized buffer.
    pub fn apply(&self, buffer: &mut String) -> Result<(), OperationError> {
        match self {
            Operation::NoOperation => Ok(()),
            Operation::Insert { offset, text } => {
                let at = byte_offset(buffer, *offset)?;
                buffer.insert_str(at, text);
                Ok(())
            }
            Operation::Delete { offset, text } => {
                let start = byte_offset(buffer, *offset)?;
                let end = offset
                    .checked_add(char_len(text))
                    .ok_or_else(|| OperationError::OutOfBounds {
                        offset: *offset,
                        len: char_len(buffer),
                    })
                    .and_then(|end| byte_offset(buffer, end))?;
                if &buffer[start..end] != text.as_str() {
                    return Err(OperationError::TextMismatch {
                        offset: *offset,
                        expected: text.clone(),
                        found: buffer[start..end].to_string(),
                    });
                }
                buffer.replace_range(start..end, "");
                Ok(())
            }
            Operation::Split(first, second) => {
                first.apply(buffer)?;
                second.apply(buffer)
            }
        }
    }
}

/// Length of `text` in chars.
pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// The chars of `text` in `[start, end)`.
pub(crate) fn char_slice(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}

fn byte_offset(buffer: &str, offset: usize) -> Result<usize, OperationError> {
    if offset == 0 {
        return Ok(0);
    }
    match buffer.char_indices().nth(offset) {
        Some((idx, _)) => Ok(idx),
        None if char_len(buffer) == offset => Ok(buffer.len()),
        None => Err(OperationError::OutOfBounds {
            offset,
            len: char_len(buffer),
        }),
    }
}
