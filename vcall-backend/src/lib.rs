//! Trait contracts for the two systems the dispatcher sits between: the IR
//! backend (variable creation, recording, kernel emission, memory) and the
//! AD engine (edge creation, gradient accumulation, graph traversal).
//!
//! Both are external collaborators with documented contracts rather than
//! machinery this crate owns — this crate *is* that documentation. It
//! ships no implementation, the same role `fuel-storage` plays for
//! `fuel-vm`: a trait-only crate that the core logic is written against
//! and that a real backend implements elsewhere.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unused_must_use)]

extern crate alloc;

mod ad;
mod error;
mod ir;

pub use ad::{AdEngine, CustomOp, IsolationGuard, TraversalFlags, TraversalMode};
pub use error::BackendError;
pub use ir::{AggregateEntry, Bucket, CallBuckets, IrBackend, RecordCheckpoint, RecordScope};
pub use vcall_types::Backend;
