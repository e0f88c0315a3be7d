//! Staging buffer: a shuffled window of source frames.
//!
//! The staging buffer holds `staging_batches * batch_size` frames pulled from
//! a [`FrameSource`](crate::source::FrameSource) in one `load` call, plus a
//! permutation defining the shuffled read order. The worker drains the window
//! batch by batch and reloads it in place when the cursor reaches the end.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::Result;
use crate::source::FrameSource;

/// Lifecycle state of the staging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    /// No frames loaded yet, or the previous window has been drained.
    Empty,
    /// A window is loaded and frames remain to be consumed.
    Ready,
}

pub struct StagingBuffer {
    feature_dim: usize,
    label_dim: usize,
    /// Frames per window.
    capacity: usize,
    features: Vec<f32>,
    labels: Vec<f32>,
    /// Bijection over `[0, capacity)` defining shuffled read order.
    permutation: Vec<usize>,
    /// Frames consumed from the current window, in permutation order.
    cursor: usize,
    /// Real frames delivered by the source before padding.
    frames_loaded: usize,
    end_of_source: bool,
    /// Absolute frame number of the first frame in the current window.
    window_start: u64,
    /// Absolute frame number the next `load` will start from.
    next_frame: u64,
    state: StagingState,
}

impl StagingBuffer {
    /// Allocates a staging buffer for `capacity` frames.
    pub fn new(capacity: usize, feature_dim: usize, label_dim: usize, start_frame: u64) -> Self {
        Self {
            feature_dim,
            label_dim,
            capacity,
            features: vec![0.0; capacity * feature_dim],
            labels: vec![0.0; capacity * label_dim],
            permutation: (0..capacity).collect(),
            cursor: 0,
            frames_loaded: 0,
            end_of_source: false,
            window_start: start_frame,
            next_frame: start_frame,
            state: StagingState::Empty,
        }
    }

    /// Loads the next window from the source, replacing the current one.
    ///
    /// If the source returns fewer frames than the window holds, the
    /// remaining slots are filled by cyclically duplicating the frames that
    /// were read (`dst = src mod frames_read`). This is specified padding
    /// behavior for the final window of a pass, not an error. The
    /// end-of-source flag from the fill is recorded.
    ///
    /// # Errors
    ///
    /// I/O and malformed-source errors from the backend propagate; they are
    /// fatal to the worker.
    pub fn load(&mut self, source: &mut dyn FrameSource) -> Result<()> {
        self.window_start = self.next_frame;

        let outcome = source.fill(&mut self.features, &mut self.labels, self.capacity)?;
        self.frames_loaded = outcome.frames_read;
        self.end_of_source = outcome.end_of_source;
        self.next_frame += outcome.frames_read as u64;
        self.cursor = 0;

        if outcome.frames_read == 0 {
            self.state = StagingState::Empty;
            return Ok(());
        }

        // Pad a short window by cycling through the frames already read.
        for dst in outcome.frames_read..self.capacity {
            let src = dst % outcome.frames_read;
            let (f_dst, f_src) = (dst * self.feature_dim, src * self.feature_dim);
            self.features
                .copy_within(f_src..f_src + self.feature_dim, f_dst);
            if self.label_dim > 0 {
                let (l_dst, l_src) = (dst * self.label_dim, src * self.label_dim);
                self.labels.copy_within(l_src..l_src + self.label_dim, l_dst);
            }
        }

        self.state = StagingState::Ready;
        Ok(())
    }

    /// Re-randomizes the read order of the current window.
    ///
    /// The permutation is always a full bijection over `[0, capacity)`.
    pub fn shuffle(&mut self, rng: &mut StdRng) {
        for (i, p) in self.permutation.iter_mut().enumerate() {
            *p = i;
        }
        self.permutation.shuffle(rng);
    }

    /// Features of the `i`-th frame in shuffled order.
    pub fn frame_features(&self, i: usize) -> &[f32] {
        let idx = self.permutation[i];
        &self.features[idx * self.feature_dim..(idx + 1) * self.feature_dim]
    }

    /// Labels of the `i`-th frame in shuffled order. Empty for unlabeled
    /// sources.
    pub fn frame_labels(&self, i: usize) -> &[f32] {
        let idx = self.permutation[i];
        &self.labels[idx * self.label_dim..(idx + 1) * self.label_dim]
    }

    /// Current read position within the window, in frames.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Advances the read position after a batch has been copied out.
    pub fn advance(&mut self, frames: usize) {
        self.cursor = (self.cursor + frames).min(self.capacity);
        if self.cursor == self.capacity {
            self.state = StagingState::Empty;
        }
    }

    /// True once every frame of the current window has been consumed.
    pub fn is_drained(&self) -> bool {
        self.cursor >= self.capacity
    }

    /// True if the last `load` produced no frames at all.
    pub fn is_empty_window(&self) -> bool {
        self.state == StagingState::Empty && self.cursor == 0
    }

    /// True once the backend reported end-of-source.
    pub fn end_of_source(&self) -> bool {
        self.end_of_source
    }

    /// Absolute frame number of the first frame in the current window.
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Window size in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn permutation(&self) -> &[usize] {
        &self.permutation
    }
}
