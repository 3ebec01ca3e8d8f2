//! Storage-engine stand-in (§10.5).
//!
//! The production bucket storage engine (on-disk/TC-based) is an external
//! collaborator out of scope here (§1); this module only supplies the shape
//! of "a local command processor" that [`crate::node::LocalNode`] dispatches
//! commands against.

pub mod engine;

pub use engine::{InMemoryStorageEngine, StorageEngine, UpdateFn};
