//! Error type shared by every fallible arena and handle operation.

use thiserror::Error;

use crate::arena::FrameId;

/// Errors reported by arenas, frames and handles.
///
/// `Exhausted` is structural: the embedding runtime has no degraded mode for
/// a starved arena and should treat it as fatal. The other variants are
/// reference errors that belong to the immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The handle's target was destroyed, or its frame was released.
    #[error("dangling reference: the target has been destroyed")]
    DanglingReference,

    /// The handle was resolved against an arena that does not own its target.
    #[error("handle does not belong to this arena")]
    ForeignArena,

    /// The arena could not grow to satisfy a request.
    #[error("arena exhausted: requested {requested} bytes with capacity {capacity}")]
    Exhausted {
        /// Total capacity the request needed.
        requested: usize,
        /// Capacity at the time of the request.
        capacity: usize,
    },

    /// The frame was never pushed on this arena, or has already been removed.
    #[error("unknown frame {0:?}")]
    UnknownFrame(FrameId),

    /// The address is not the payload of a live slot.
    #[error("address {addr:#x} is not the payload of a live slot")]
    NotASlot {
        /// Offending payload address.
        addr: usize,
    },

    /// The type needs a stricter alignment than slots provide.
    #[error("{type_name} needs alignment {align}, slots only guarantee {max}")]
    UnsupportedAlignment {
        /// Name of the rejected type.
        type_name: &'static str,
        /// Alignment required by the type.
        align: usize,
        /// Alignment every slot payload has.
        max: usize,
    },

    /// The slot's type was registered without a copy callback.
    #[error("{type_name} was registered without a copy callback")]
    NotCopyable {
        /// Name of the slot's type.
        type_name: &'static str,
    },

    /// A checked cast found a different target type.
    #[error("cannot cast handle to {from} into {to}")]
    InvalidCast {
        /// Type the handle actually refers to.
        from: &'static str,
        /// Type that was requested.
        to: &'static str,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArenaError>;
