//! Domain identifiers (strongly-typed IDs).
//!
//! All identifiers are ULIDs wrapped in a phantom-typed `Id<T>`:
//! - sortable by creation time, so logs read in submission order
//! - generated without coordination (no global counter to lock)
//! - `ProcedureId` and `ConditionId` are distinct types and cannot be mixed up

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID kind.
///
/// Provides the prefix used by `Display` ("procedure-", "condition-", ...).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type.
///
/// `T` only exists at compile time (`PhantomData`), so an `Id<T>` is exactly
/// as large as the ULID it wraps.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Marker types
// ========================================

/// Marker for procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcedureMarker {}

impl IdMarker for ProcedureMarker {
    fn prefix() -> &'static str {
        "procedure-"
    }
}

/// Marker for conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionMarker {}

impl IdMarker for ConditionMarker {
    fn prefix() -> &'static str {
        "condition-"
    }
}

/// Marker for queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueMarker {}

impl IdMarker for QueueMarker {
    fn prefix() -> &'static str {
        "queue-"
    }
}

/// Identifier of a procedure (stable for its whole lifetime).
pub type ProcedureId = Id<ProcedureMarker>;

/// Identifier of a condition. Compound conditions deduplicate on it.
pub type ConditionId = Id<ConditionMarker>;

/// Identifier of a queue. Delegates shared between queues compare on it.
pub type QueueId = Id<QueueMarker>;
