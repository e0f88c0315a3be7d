//! Backend frame sources.
//!
//! A [`FrameSource`] supplies raw frames (fixed-size feature vectors plus
//! optional label vectors) to the staging buffer. The streaming engine is
//! generic over this capability interface; each dataset format implements it
//! once and the engine never learns about on-disk details.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, StreamError};
use crate::storage::{StorageBackend, StorageReader};

/// Result of a single [`FrameSource::fill`] call.
#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    /// Number of frames actually written into the destination.
    pub frames_read: usize,
    /// True once the source has no frames beyond the ones returned so far.
    pub end_of_source: bool,
}

/// A backend data source that produces frames on demand.
///
/// Implementations must deliver frames in a stable order so that `seek`
/// followed by `fill` reproduces the same stream: resumption after a crash
/// depends on it.
pub trait FrameSource: Send {
    /// Number of `f32` features per frame. Must be non-zero.
    fn feature_dim(&self) -> usize;

    /// Number of `f32` labels per frame. Zero for unlabeled sources.
    fn label_dim(&self) -> usize;

    /// Reads up to `max_frames` frames into the destination slices.
    ///
    /// `features` must hold at least `max_frames * feature_dim()` values and
    /// `labels` at least `max_frames * label_dim()`. Frames are written
    /// contiguously from the front; a short read is not an error.
    fn fill(
        &mut self,
        features: &mut [f32],
        labels: &mut [f32],
        max_frames: usize,
    ) -> Result<FillOutcome>;

    /// Repositions the source so the next `fill` starts at `frame`.
    fn seek(&mut self, frame: u64) -> Result<()>;

    /// Maps a frame number to the position a checkpoint should record.
    ///
    /// Record-oriented sources override this to snap back to the start of
    /// the record containing `frame`, so resumption never lands mid-record.
    fn checkpoint_position(&self, frame: u64) -> u64 {
        frame
    }
}

/// An in-memory frame source, used in tests and for small datasets that fit
/// in RAM.
pub struct InMemorySource {
    feature_dim: usize,
    label_dim: usize,
    features: Vec<f32>,
    labels: Vec<f32>,
    cursor: u64,
}

impl InMemorySource {
    /// Creates a source over pre-loaded frame data.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the slices don't divide evenly into
    /// frames or the feature and label frame counts disagree.
    pub fn new(
        feature_dim: usize,
        label_dim: usize,
        features: Vec<f32>,
        labels: Vec<f32>,
    ) -> Result<Self> {
        if feature_dim == 0 {
            return Err(StreamError::config("feature_dim must be greater than 0"));
        }
        if features.len() % feature_dim != 0 {
            return Err(StreamError::config(
                "feature data length is not a multiple of feature_dim",
            ));
        }
        let frames = features.len() / feature_dim;
        if label_dim == 0 {
            if !labels.is_empty() {
                return Err(StreamError::config(
                    "label data supplied for an unlabeled source",
                ));
            }
        } else if labels.len() != frames * label_dim {
            return Err(StreamError::config(
                "label data length does not match frame count",
            ));
        }

        Ok(Self {
            feature_dim,
            label_dim,
            features,
            labels,
            cursor: 0,
        })
    }

    /// Total number of frames in the source.
    pub fn total_frames(&self) -> u64 {
        (self.features.len() / self.feature_dim) as u64
    }
}

impl FrameSource for InMemorySource {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn label_dim(&self) -> usize {
        self.label_dim
    }

    fn fill(
        &mut self,
        features: &mut [f32],
        labels: &mut [f32],
        max_frames: usize,
    ) -> Result<FillOutcome> {
        let total = self.total_frames();
        let remaining = total.saturating_sub(self.cursor) as usize;
        let frames_read = remaining.min(max_frames);

        let f_start = self.cursor as usize * self.feature_dim;
        let f_len = frames_read * self.feature_dim;
        features[..f_len].copy_from_slice(&self.features[f_start..f_start + f_len]);

        if self.label_dim > 0 {
            let l_start = self.cursor as usize * self.label_dim;
            let l_len = frames_read * self.label_dim;
            labels[..l_len].copy_from_slice(&self.labels[l_start..l_start + l_len]);
        }

        self.cursor += frames_read as u64;
        Ok(FillOutcome {
            frames_read,
            end_of_source: self.cursor >= total,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        if frame > self.total_frames() {
            return Err(StreamError::backend(
                "in-memory",
                format!(
                    "seek to frame {frame} beyond source end ({})",
                    self.total_frames()
                ),
            ));
        }
        self.cursor = frame;
        Ok(())
    }
}

/// A frame source backed by a binary file of fixed-size records.
///
/// Each record is `(feature_dim + label_dim)` little-endian `f32` values:
/// features first, then labels. The file size must be an exact multiple of
/// the record size.
pub struct FrameFileSource {
    name: String,
    reader: Box<dyn StorageReader>,
    feature_dim: usize,
    label_dim: usize,
    total_frames: u64,
    cursor: u64,
}

impl FrameFileSource {
    /// Opens a frame file through the storage backend.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the file cannot be opened or its size is
    /// not a whole number of records.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        path: impl Into<PathBuf>,
        feature_dim: usize,
        label_dim: usize,
    ) -> Result<Self> {
        if feature_dim == 0 {
            return Err(StreamError::config("feature_dim must be greater than 0"));
        }

        let path = path.into();
        let name = path.display().to_string();
        let reader = storage.open_read(&path)?;

        let record_bytes = ((feature_dim + label_dim) * 4) as u64;
        let size = reader.size();
        if size % record_bytes != 0 {
            return Err(StreamError::backend(
                name,
                format!(
                    "malformed frame file: {size} bytes is not a multiple of the \
                     {record_bytes}-byte record size"
                ),
            ));
        }

        Ok(Self {
            name,
            reader,
            feature_dim,
            label_dim,
            total_frames: size / record_bytes,
            cursor: 0,
        })
    }

    /// Total number of frames in the file.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn record_bytes(&self) -> u64 {
        ((self.feature_dim + self.label_dim) * 4) as u64
    }
}

impl FrameSource for FrameFileSource {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn label_dim(&self) -> usize {
        self.label_dim
    }

    fn fill(
        &mut self,
        features: &mut [f32],
        labels: &mut [f32],
        max_frames: usize,
    ) -> Result<FillOutcome> {
        let remaining = self.total_frames.saturating_sub(self.cursor) as usize;
        let frames_read = remaining.min(max_frames);

        let start = self.cursor * self.record_bytes();
        let length = frames_read * self.record_bytes() as usize;
        let bytes = self.reader.read_range(start, length)?;
        if bytes.len() != length {
            return Err(StreamError::backend(
                self.name.clone(),
                format!(
                    "short read: wanted {length} bytes at offset {start}, got {}",
                    bytes.len()
                ),
            ));
        }

        let values_per_frame = self.feature_dim + self.label_dim;
        for frame in 0..frames_read {
            let base = frame * values_per_frame * 4;
            for i in 0..self.feature_dim {
                let off = base + i * 4;
                features[frame * self.feature_dim + i] = f32::from_le_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]);
            }
            for i in 0..self.label_dim {
                let off = base + (self.feature_dim + i) * 4;
                labels[frame * self.label_dim + i] = f32::from_le_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                    bytes[off + 3],
                ]);
            }
        }

        self.cursor += frames_read as u64;
        Ok(FillOutcome {
            frames_read,
            end_of_source: self.cursor >= self.total_frames,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        if frame > self.total_frames {
            return Err(StreamError::backend(
                self.name.clone(),
                format!(
                    "seek to frame {frame} beyond source end ({})",
                    self.total_frames
                ),
            ));
        }
        self.cursor = frame;
        Ok(())
    }
}
