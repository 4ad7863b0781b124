//! The dispatcher's own error taxonomy.
//!
//! Kept separate from [`vcall_backend::BackendError`]: that enum is for
//! failures reported *by* the IR/AD collaborators (out of memory, a
//! vanished registry entry); this one is for violations the dispatcher
//! itself detects while validating shapes, return values, and loop state.

use alloc::string::String;
use vcall_backend::BackendError;
use vcall_types::{Size, VarType};

/// Result alias used throughout `vcall-core`.
pub type Result<T> = core::result::Result<T, DispatchError>;

/// Every way a dispatch, if-statement, or while-loop call can fail. Each variant is raised at its first detection point and never
/// silently recovered.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DispatchError {
    /// Argument sizes don't unify: some non-broadcast input disagrees
    /// with the unified size.
    #[display(fmt = "shape mismatch: size {found} is incompatible with unified size {expected}")]
    ShapeMismatch {
        /// The size the call had already unified to.
        expected: Size,
        /// The size that failed to unify against it.
        found: Size,
    },

    /// Both `domain` and `callable_count` were supplied, or neither.
    #[display(fmt = "exactly one of `domain` and `callable_count` must be supplied")]
    ModeConflict,

    /// An evaluated call was attempted while a symbolic region was
    /// already active and `SymbolicCalls` was not set.
    #[display(fmt = "evaluated call attempted inside an active symbolic region")]
    SymbolicModeRequired,

    /// `user_fn` returned a zero (uninitialized) handle for some output
    /// slot.
    #[display(fmt = "callable {callable} returned an empty handle for slot {slot}")]
    EmptyReturn {
        /// The callable id that produced the empty return.
        callable: u32,
        /// The return slot index.
        slot: u32,
    },

    /// Two callables disagreed on how many values they return.
    #[display(
        fmt = "callable {callable} returned {found} value(s), expected {expected} (fixed by the first non-empty callable)"
    )]
    ReturnArityMismatch {
        /// The callable id that disagreed.
        callable: u32,
        /// The arity fixed by the first non-empty callable.
        expected: usize,
        /// The arity this callable actually returned.
        found: usize,
    },

    /// Two callables disagreed on a return slot's type.
    #[display(fmt = "callable {callable} slot {slot}: expected type {expected:?}, found {found:?}")]
    ReturnTypeMismatch {
        /// The callable id that disagreed.
        callable: u32,
        /// The return slot index.
        slot: u32,
        /// The type fixed by the first non-empty callable.
        expected: VarType,
        /// The type this callable actually returned.
        found: VarType,
    },

    /// Two callables disagreed on a return slot's backend residency.
    #[display(fmt = "callable {callable} slot {slot}: return backend disagreement")]
    ReturnBackendMismatch {
        /// The callable id that disagreed.
        callable: u32,
        /// The return slot index.
        slot: u32,
    },

    /// The getter strategy observed a non-scalar output.
    #[display(fmt = "callable {callable} returned a non-scalar value from a getter call")]
    ReturnNotScalar {
        /// The callable id that returned a non-scalar value.
        callable: u32,
    },

    /// The evaluated strategy's bucket reduction produced a callable id
    /// no longer bound in the registry.
    #[display(fmt = "callable {callable} is no longer registered")]
    RegistryMiss {
        /// The callable id missing from the registry.
        callable: u32,
    },

    /// A while-loop's pytree traversal visited a leaf whose name or type
    /// changed between iterations.
    #[display(fmt = "loop state changed at leaf {path:?}: {reason}")]
    LoopStateChanged {
        /// The path-derived name of the offending leaf.
        path: String,
        /// What changed (name, type, or ordering).
        reason: String,
    },

    /// A while-loop leaf's size changed in a way other than 1 -> N.
    #[display(fmt = "loop state leaf {path:?} changed size from {from} to {to}")]
    LoopSizeConflict {
        /// The path-derived name of the offending leaf.
        path: String,
        /// The leaf's size on the previous iteration.
        from: Size,
        /// The leaf's size on this iteration.
        to: Size,
    },

    /// An if-statement's two branches returned differently shaped state.
    #[display(fmt = "if-branches disagree on result shape at {path:?}: {reason}")]
    ReturnShapeMismatch {
        /// The path-derived name of the offending leaf.
        path: String,
        /// What differed between the branches.
        reason: String,
    },

    /// An internal bookkeeping invariant was violated: this indicates a
    /// bug in `vcall-core` itself, not a misuse by the caller.
    #[display(fmt = "internal invariant violated: {0}")]
    InternalInvariant(Bug),

    /// The IR backend or AD engine itself failed servicing the call.
    #[display(fmt = "backend error: {0}")]
    Backend(BackendError),
}

#[cfg(feature = "std")]
impl std::error::Error for DispatchError {}

impl From<Bug> for DispatchError {
    fn from(bug: Bug) -> Self {
        Self::InternalInvariant(bug)
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

/// A "should be impossible" condition, distinguished from the ordinary,
/// caller-triggerable [`DispatchError`] variants so that callers and
/// tests can tell a library bug apart from a misuse of the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bug {
    /// Which invariant was violated.
    pub variant: BugVariant,
    /// An optional human-readable detail, attached by the call site that
    /// detected the violation.
    pub message: Option<String>,
}

impl core::fmt::Display for Bug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.variant)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl Bug {
    /// Construct a bug report with no extra detail.
    pub fn new(variant: BugVariant) -> Self {
        Self {
            variant,
            message: None,
        }
    }

    /// Attach a human-readable detail message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The specific internal invariant a [`Bug`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BugVariant {
    /// A pytree traversal consumed a different number of leaves on a
    /// later pass than the entry table recorded on the first pass.
    #[display(fmt = "pytree traversal consumed a different number of leaves than the entry table recorded")]
    LeafCountMismatch,
    /// A scoped stack (mask/self/recording-scope) was popped more times
    /// than it was pushed, or left at the wrong depth on return.
    #[display(fmt = "scoped stack depth does not match its depth on entry")]
    UnbalancedScope,
    /// The recording strategy's checkpoint bookkeeping observed fewer or
    /// more checkpoint pairs than `callable_count`.
    #[display(fmt = "checkpoint count does not match callable count")]
    CheckpointCountMismatch,
    /// A pytree traversal revisited a container it was already inside of.
    #[display(fmt = "cyclic pytree: a container was revisited during traversal")]
    CyclicPyTree,
}
