//! The error taxonomy (spec.md §7), carried as a single enum so the engine
//! never lets anything escape as a panic or unwind.

use crate::context::CallContext;
use crate::kind::AllocKind;

/// Severity an [`EngineError`] is reported at once it reaches the event
/// recorder. A `Warning` still lets the originating operation succeed;
/// anything else cancels it (or, for [`Severity::Fatal`], traps the process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// Every way an engine operation can fail or warn, per spec.md §7.
///
/// Carries the call context of the operation that raised it and, where the
/// error concerns an existing record, the allocation context captured when
/// that record was created or last touched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("allocation of size zero requested")]
    AllocZero { context: CallContext },

    #[error("realloc called with a null pointer")]
    ReallocNull { context: CallContext },

    #[error("realloc called with new size zero")]
    ReallocZero { context: CallContext },

    #[error("free called with a null pointer")]
    FreeNull { context: CallContext },

    #[error("alignment of zero requested, coerced to the minimum")]
    ZeroAlign { context: CallContext },

    #[error("alignment {requested} is not a power of two, coerced to {coerced}")]
    BadAlign {
        context: CallContext,
        requested: usize,
        coerced: usize,
    },

    #[error("alignment {requested} exceeds the page size, coerced to {coerced}")]
    MaxAlign {
        context: CallContext,
        requested: usize,
        coerced: usize,
    },

    #[error("pointer was never returned by this engine")]
    NotAllocated { context: CallContext },

    #[error("pointer is interior to a live allocation, not its base")]
    MismatchedFree {
        context: CallContext,
        allocated_at: CallContext,
    },

    #[error("pointer refers to a block already freed")]
    PreviouslyFreed {
        context: CallContext,
        freed_at: CallContext,
    },

    #[error("release kind {release_kind:?} is incompatible with allocating kind {alloc_kind:?}")]
    IncompatibleRelease {
        context: CallContext,
        allocated_at: CallContext,
        alloc_kind: AllocKind,
        release_kind: AllocKind,
    },

    #[error("bulk-memory operation on a null region")]
    NullOperation { context: CallContext },

    #[error("bulk-memory operation on free heap space")]
    FreeOperation { context: CallContext },

    #[error("bulk-memory operation on a retained-freed region")]
    FreedOperation { context: CallContext },

    #[error("range [{base:#x}, {base_plus_len:#x}) overflows its guard region")]
    RangeOverflow {
        context: CallContext,
        base: usize,
        base_plus_len: usize,
    },

    #[error("ranges [{a_base:#x}, {a_end:#x}) and [{b_base:#x}, {b_end:#x}) overlap")]
    RangeOverlap {
        context: CallContext,
        a_base: usize,
        a_end: usize,
        b_base: usize,
        b_end: usize,
    },

    #[error("string scan from {base:#x} crossed a guard boundary before finding a terminator")]
    StringOverflow { context: CallContext, base: usize },

    #[error("overflow guard before a live allocation was corrupted")]
    AllocOverflowCorruption {
        context: CallContext,
        allocated_at: CallContext,
        address: usize,
        sample: Vec<u8>,
    },

    #[error("overflow guard before a retained-freed allocation was corrupted")]
    FreedOverflowCorruption {
        context: CallContext,
        allocated_at: CallContext,
        address: usize,
        sample: Vec<u8>,
    },

    #[error("free-byte pattern in free heap space was corrupted")]
    FreeCorruption {
        context: CallContext,
        address: usize,
        sample: Vec<u8>,
    },

    #[error("free-byte pattern in a retained-freed allocation was corrupted")]
    FreedCorruption {
        context: CallContext,
        allocated_at: CallContext,
        address: usize,
        sample: Vec<u8>,
    },

    #[error("out of memory")]
    OutOfMemory { context: CallContext },
}

impl EngineError {
    /// The severity this error is reported at, per spec.md §7's classification.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::AllocZero { .. }
            | Self::ReallocNull { .. }
            | Self::ReallocZero { .. }
            | Self::FreeNull { .. }
            | Self::ZeroAlign { .. }
            | Self::BadAlign { .. }
            | Self::MaxAlign { .. } => Severity::Warning,

            Self::RangeOverflow { .. } | Self::RangeOverlap { .. } | Self::StringOverflow { .. } => {
                Severity::Warning
            }

            Self::AllocOverflowCorruption { .. }
            | Self::FreedOverflowCorruption { .. }
            | Self::FreeCorruption { .. }
            | Self::FreedCorruption { .. } => Severity::Fatal,

            _ => Severity::Error,
        }
    }

    /// True if this error's default severity is demoted to a warning when
    /// `allow_overflow` is configured (only meaningful for the
    /// range/string-overflow family; callers decide the final severity).
    #[must_use]
    pub fn is_overflow_class(&self) -> bool {
        matches!(
            self,
            Self::RangeOverflow { .. } | Self::RangeOverlap { .. } | Self::StringOverflow { .. }
        )
    }

    /// The call context that raised this error, for logging.
    #[must_use]
    pub fn context(&self) -> &CallContext {
        match self {
            Self::AllocZero { context }
            | Self::ReallocNull { context }
            | Self::ReallocZero { context }
            | Self::FreeNull { context }
            | Self::ZeroAlign { context }
            | Self::BadAlign { context, .. }
            | Self::MaxAlign { context, .. }
            | Self::NotAllocated { context }
            | Self::MismatchedFree { context, .. }
            | Self::PreviouslyFreed { context, .. }
            | Self::IncompatibleRelease { context, .. }
            | Self::NullOperation { context }
            | Self::FreeOperation { context }
            | Self::FreedOperation { context }
            | Self::RangeOverflow { context, .. }
            | Self::RangeOverlap { context, .. }
            | Self::StringOverflow { context, .. }
            | Self::AllocOverflowCorruption { context, .. }
            | Self::FreedOverflowCorruption { context, .. }
            | Self::FreeCorruption { context, .. }
            | Self::FreedCorruption { context, .. }
            | Self::OutOfMemory { context } => context,
        }
    }
}
