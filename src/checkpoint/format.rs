//! On-disk checkpoint file formats.
//!
//! Every checkpoint artifact starts with the same commit prologue:
//!
//! ```text
//! +--------------------------+
//! | Checksum region (16 B)   |  <- XxHash64 of the payload in bytes 0..8,
//! +--------------------------+     bytes 8..16 reserved as zero
//! | Tag (4 B ASCII)          |  <- "FAIL" while writing, "DONE" once valid
//! +--------------------------+
//! | Payload                  |
//! +--------------------------+
//! ```
//!
//! A generation is valid if and only if its record file's tag reads "DONE";
//! anything else means a crash interrupted the commit and the loader must
//! fall back to an older generation.
//!
//! The record payload is a fixed little-endian binary record (ids, progress
//! counters, model filename). The model payload is a layer directory (dims,
//! activation names, byte offsets rounded up to 1024-byte boundaries)
//! followed by raw per-layer `f32` arrays at those offsets.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::{Result, StreamError};
use crate::trainer::{ModelLayer, ModelSnapshot};

/// Byte length of the reserved checksum region.
pub const CHECKSUM_LEN: usize = 16;
/// Byte length of the commit tag.
pub const TAG_LEN: usize = 4;
/// Payload offset within every checkpoint artifact.
pub const PAYLOAD_OFFSET: usize = CHECKSUM_LEN + TAG_LEN;
/// Tag written before the payload: marks an in-flight or interrupted commit.
pub const TAG_FAIL: [u8; TAG_LEN] = *b"FAIL";
/// Tag flipped in after the payload is durable: marks a valid artifact.
pub const TAG_DONE: [u8; TAG_LEN] = *b"DONE";
/// Per-layer weight arrays start on this alignment within the model file.
pub const LAYER_ALIGN: u64 = 1024;

/// One checkpoint generation's metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Generation id; ids are dense and increase by one per tick.
    pub generation: u64,
    /// Trainer progress: minibatches processed.
    pub batch: u64,
    /// Trainer progress: completed epochs.
    pub epoch: u64,
    /// Source frame number it is safe to resume from.
    pub resume_frame: u64,
    /// Filename of this generation's model weight file, relative to the
    /// checkpoint directory.
    pub model_file: String,
}

impl CheckpointRecord {
    /// Serializes the record payload (everything after the tag).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 4 + 4 + self.model_file.len());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.batch.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.resume_frame.to_le_bytes());
        buf.extend_from_slice(&(self.model_file.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.model_file.as_bytes());
        buf
    }

    /// Parses a record payload.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the payload is truncated or the
    /// filename is not valid UTF-8.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(payload);
        let generation = cur.read_u64()?;
        let batch = cur.read_u64()?;
        let epoch = cur.read_u64()?;
        let resume_frame = cur.read_u64()?;
        let name_len = cur.read_u32()? as usize;
        let name_bytes = cur.read_bytes(name_len)?;
        let model_file = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| StreamError::checkpoint_with_source("model filename is not UTF-8", e))?;

        Ok(Self {
            generation,
            batch,
            epoch,
            resume_frame,
            model_file,
        })
    }
}

/// Computes the checksum stored in the first 8 bytes of the checksum region.
pub fn payload_checksum(payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(payload);
    hasher.finish()
}

/// Fills a 16-byte checksum region: hash in bytes 0..8, the rest reserved.
pub fn checksum_region(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut region = [0u8; CHECKSUM_LEN];
    region[..8].copy_from_slice(&payload_checksum(payload).to_le_bytes());
    region
}

/// Rounds `offset` up to the next multiple of `align`.
pub fn align_up(offset: u64, align: u64) -> u64 {
    offset.div_ceil(align) * align
}

/// Serializes a model snapshot into its file payload: layer directory first,
/// then zero padding, then each layer's raw `f32` weights at its recorded
/// 1024-aligned offset.
///
/// Offsets in the directory are absolute file offsets, so they account for
/// the checksum region and tag that precede the payload on disk.
pub fn model_to_payload(model: &ModelSnapshot) -> Vec<u8> {
    let mut directory = Vec::new();
    directory.extend_from_slice(&(model.layers.len() as u32).to_le_bytes());

    // Directory size must be known before offsets can be assigned, and
    // entry size depends only on string lengths.
    let dir_len: usize = 4 + model
        .layers
        .iter()
        .map(|l| 4 + l.name.len() + 4 + l.activation.len() + 8 * 4)
        .sum::<usize>();

    let mut next_offset = align_up((PAYLOAD_OFFSET + dir_len) as u64, LAYER_ALIGN);
    let mut offsets = Vec::with_capacity(model.layers.len());

    for layer in &model.layers {
        let byte_len = layer.weights.len() as u64 * 4;
        directory.extend_from_slice(&(layer.name.len() as u32).to_le_bytes());
        directory.extend_from_slice(layer.name.as_bytes());
        directory.extend_from_slice(&(layer.activation.len() as u32).to_le_bytes());
        directory.extend_from_slice(layer.activation.as_bytes());
        directory.extend_from_slice(&layer.rows.to_le_bytes());
        directory.extend_from_slice(&layer.cols.to_le_bytes());
        directory.extend_from_slice(&next_offset.to_le_bytes());
        directory.extend_from_slice(&byte_len.to_le_bytes());
        offsets.push(next_offset);
        next_offset = align_up(next_offset + byte_len, LAYER_ALIGN);
    }

    debug_assert_eq!(directory.len(), dir_len);

    let total = model
        .layers
        .last()
        .map(|l| {
            offsets[model.layers.len() - 1] + l.weights.len() as u64 * 4
                - PAYLOAD_OFFSET as u64
        })
        .unwrap_or(dir_len as u64);

    let mut payload = vec![0u8; total as usize];
    payload[..directory.len()].copy_from_slice(&directory);

    for (layer, offset) in model.layers.iter().zip(&offsets) {
        let mut pos = (*offset as usize) - PAYLOAD_OFFSET;
        for w in &layer.weights {
            payload[pos..pos + 4].copy_from_slice(&w.to_le_bytes());
            pos += 4;
        }
    }

    payload
}

/// Parses a model file payload back into a snapshot.
///
/// # Errors
///
/// Returns a checkpoint error on truncation, bad UTF-8, or a layer whose
/// recorded length disagrees with its dims.
pub fn model_from_payload(payload: &[u8]) -> Result<ModelSnapshot> {
    let mut cur = Cursor::new(payload);
    let layer_count = cur.read_u32()? as usize;

    let mut headers = Vec::with_capacity(layer_count);
    for _ in 0..layer_count {
        let name_len = cur.read_u32()? as usize;
        let name = String::from_utf8(cur.read_bytes(name_len)?.to_vec())
            .map_err(|e| StreamError::checkpoint_with_source("layer name is not UTF-8", e))?;
        let act_len = cur.read_u32()? as usize;
        let activation = String::from_utf8(cur.read_bytes(act_len)?.to_vec())
            .map_err(|e| StreamError::checkpoint_with_source("activation name is not UTF-8", e))?;
        let rows = cur.read_u64()?;
        let cols = cur.read_u64()?;
        let offset = cur.read_u64()?;
        let byte_len = cur.read_u64()?;

        if byte_len != rows * cols * 4 {
            return Err(StreamError::checkpoint(format!(
                "layer '{name}' length {byte_len} does not match dims {rows}x{cols}"
            )));
        }
        headers.push((name, activation, rows, cols, offset, byte_len));
    }

    let mut layers = Vec::with_capacity(layer_count);
    for (name, activation, rows, cols, offset, byte_len) in headers {
        let start = (offset as usize)
            .checked_sub(PAYLOAD_OFFSET)
            .ok_or_else(|| StreamError::checkpoint("layer offset inside file header"))?;
        let end = start + byte_len as usize;
        if end > payload.len() {
            return Err(StreamError::checkpoint(format!(
                "layer '{name}' data extends past end of file"
            )));
        }

        let weights = payload[start..end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        layers.push(ModelLayer {
            name,
            activation,
            rows,
            cols,
            weights,
        });
    }

    Ok(ModelSnapshot { layers })
}

/// Bounds-checked little-endian reader over a payload slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(StreamError::checkpoint(format!(
                "truncated payload: wanted {len} bytes at offset {}",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
