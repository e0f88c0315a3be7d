//! Trainer-side collaborator interface.
//!
//! The checkpoint coordinator snapshots trainer progress and model weights
//! through this seam; the training math itself lives outside this crate.

use crate::error::Result;

/// Trainer progress counters captured in every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainerProgress {
    /// Minibatches processed so far.
    pub batch: u64,
    /// Completed passes over the source.
    pub epoch: u64,
}

/// One named weight matrix in a model snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLayer {
    pub name: String,
    /// Activation function name, stored alongside the dims so a snapshot is
    /// self-describing.
    pub activation: String,
    pub rows: u64,
    pub cols: u64,
    /// `rows * cols` weights, row-major.
    pub weights: Vec<f32>,
}

/// A self-contained copy of the model at one point in training.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSnapshot {
    pub layers: Vec<ModelLayer>,
}

/// Interface the checkpoint coordinator uses to observe the trainer.
///
/// Both methods are called from the coordinator thread; implementations must
/// take their own locks and keep the critical sections brief and free of
/// I/O.
pub trait TrainerFacade: Send + Sync {
    /// Current progress counters.
    fn progress(&self) -> TrainerProgress;

    /// Captures a consistent copy of the model weights.
    fn snapshot_model(&self) -> Result<ModelSnapshot>;
}
