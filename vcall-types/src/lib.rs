//! Atomic types shared between the dispatcher core and the backend traits
//! it is written against.
//!
//! This crate carries no logic: it is the vocabulary — handle identifiers,
//! the autodiff tag, the instance index, and the logical-size rules used to
//! unify argument shapes — with nothing that knows how to evaluate an IR
//! graph or walk an AD graph.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unused_must_use)]

mod ad;
mod handle;
mod instance;
mod size;

pub use ad::AdHandle;
pub use handle::{Backend, HandleState, IrHandle, VarType};
pub use instance::InstanceId;
pub use size::{unify_size, Size, SizeError};

/// Sentinel callable/instance id meaning "no instance"; lane is masked off.
pub const NULL_INSTANCE: InstanceId = InstanceId::new(0);
