//! Sync module
//!
//! Hash-checked single-file transfers between the local filesystem and a
//! blob container.

pub mod conflict;
pub mod engine;

pub use conflict::{decide, Conflict, Decision, FileInfo};
pub use engine::{Direction, SyncEngine, TransferOutcome, TransferRequest};
