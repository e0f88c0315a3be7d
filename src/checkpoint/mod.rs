//! Checkpoint persistence and recovery.

pub mod coordinator;
pub mod format;
pub mod store;

pub use coordinator::{CheckpointCoordinator, ResumeCursor};
pub use format::CheckpointRecord;
pub use store::CheckpointStore;
