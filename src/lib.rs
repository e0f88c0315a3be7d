//! Batch Streaming and Checkpoint Runtime
//!
//! This crate provides the data side of a minibatch trainer: shuffled batch
//! streaming from backend frame sources through a bounded ring, plus
//! periodic crash-safe checkpointing with frame-lossless resumption.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{BatchConfig, CheckpointConfig, StorageConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageFile, StorageReader, StorageWriter};

pub mod ring;
pub mod source;
pub mod staging;
pub use ring::{BatchRing, BatchSlot};
pub use source::{FillOutcome, FrameFileSource, FrameSource, InMemorySource};
pub use staging::StagingBuffer;

pub mod provider;
pub mod trainer;
mod worker;
pub use provider::{BatchRef, DataProvider};
pub use trainer::{ModelLayer, ModelSnapshot, TrainerFacade, TrainerProgress};

pub mod checkpoint;
pub use checkpoint::{CheckpointCoordinator, CheckpointRecord, CheckpointStore, ResumeCursor};

pub mod runtime;
pub use runtime::StreamRuntime;
