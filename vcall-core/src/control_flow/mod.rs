//! Control-flow frontends built on the same recording machinery as the
//! indirect-call dispatcher.

pub mod if_stmt;
pub mod while_loop;

pub use if_stmt::{if_stmt, IfMode};
pub use while_loop::{while_loop, LoopMode};
