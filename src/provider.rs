//! Consumer-facing batch streaming facade.
//!
//! A `DataProvider` owns the worker thread and the ring, and exposes the
//! training loop's view of the stream: borrow the current minibatch, release
//! it, poll availability, and read the safe checkpoint frame.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::checkpoint::ResumeCursor;
use crate::config::BatchConfig;
use crate::error::{Result, StreamError};
use crate::ring::{BatchRing, BatchSlot};
use crate::source::FrameSource;
use crate::worker::{self, WorkerParams, WorkerShared};

/// A borrowed view of one ready minibatch.
///
/// Holds the slot checked out for reading; call
/// [`DataProvider::next_batch`] after dropping it to hand the slot back to
/// the producer.
pub struct BatchRef<'a> {
    slot: std::sync::MutexGuard<'a, BatchSlot>,
    feature_dim: usize,
    label_dim: usize,
}

impl BatchRef<'_> {
    /// Feature values, `frames() * feature_dim` long, frame-major.
    pub fn features(&self) -> &[f32] {
        &self.slot.features[..self.slot.frames * self.feature_dim]
    }

    /// Label values, `frames() * label_dim` long. Empty for unlabeled
    /// sources.
    pub fn labels(&self) -> &[f32] {
        &self.slot.labels[..self.slot.frames * self.label_dim]
    }

    /// Frames in this minibatch.
    pub fn frames(&self) -> usize {
        self.slot.frames
    }
}

pub struct DataProvider {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
    batch_size: usize,
    feature_dim: usize,
    label_dim: usize,
}

impl DataProvider {
    /// Starts streaming from the beginning of the source.
    pub fn new(config: &BatchConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        Self::with_start_frame(config, source, 0)
    }

    /// Starts streaming from `start_frame`, the position a recovered
    /// checkpoint names.
    ///
    /// The batching configuration is validated here, not just at config
    /// load: an undersized staging window would let `checkpoint_frame`
    /// report a position ahead of consumption.
    ///
    /// # Errors
    ///
    /// Configuration and source-seek errors propagate; the worker thread is
    /// only spawned once the source is positioned.
    pub fn with_start_frame(
        config: &BatchConfig,
        mut source: Box<dyn FrameSource>,
        start_frame: u64,
    ) -> Result<Self> {
        config.validate()?;

        let feature_dim = source.feature_dim();
        let label_dim = source.label_dim();
        if feature_dim == 0 {
            return Err(StreamError::config("source feature dimension must be nonzero"));
        }

        source.seek(start_frame)?;

        let ring = Arc::new(BatchRing::new(
            config.ring_capacity,
            config.batch_size,
            feature_dim,
            label_dim,
        )?);
        let start_position = source.checkpoint_position(start_frame);
        let shared = Arc::new(WorkerShared::new(ring, start_position));

        let handle = worker::spawn(
            Arc::clone(&shared),
            source,
            WorkerParams {
                batch_size: config.batch_size,
                staging_frames: config.staging_batches * config.batch_size,
                start_frame,
                seed: config.seed,
            },
        );

        info!(
            start_frame,
            batch_size = config.batch_size,
            ring_capacity = config.ring_capacity,
            "data provider started"
        );

        Ok(Self {
            shared,
            handle: Some(handle),
            batch_size: config.batch_size,
            feature_dim,
            label_dim,
        })
    }

    /// Borrows the current ready minibatch, waiting for one if `blocking`.
    ///
    /// Repeated calls without an intervening [`next_batch`] return the same
    /// minibatch.
    ///
    /// # Errors
    ///
    /// - [`StreamError::SizeMismatch`] if `batch_size` differs from the
    ///   configured one; slots are sized once at startup.
    /// - [`StreamError::WouldBlock`] if non-blocking and nothing is ready.
    /// - [`StreamError::NotRunning`] once the stream is exhausted and
    ///   drained, or a worker failure, surfaced exactly once.
    ///
    /// [`next_batch`]: DataProvider::next_batch
    pub fn get_batch_data(&self, batch_size: usize, blocking: bool) -> Result<BatchRef<'_>> {
        if batch_size != self.batch_size {
            return Err(StreamError::SizeMismatch {
                expected: self.batch_size,
                requested: batch_size,
            });
        }

        let idx = match self.shared.ring.acquire_for_read(blocking) {
            Ok(idx) => idx,
            // A failed worker closes the ring; its error outranks the
            // generic closed-ring one.
            Err(e) => return Err(self.shared.take_failure().unwrap_or(e)),
        };

        Ok(BatchRef {
            slot: self.shared.ring.slot(idx),
            feature_dim: self.feature_dim,
            label_dim: self.label_dim,
        })
    }

    /// Releases the current minibatch back to the producer.
    ///
    /// # Errors
    ///
    /// Protocol error if no minibatch is checked out.
    pub fn next_batch(&self) -> Result<()> {
        self.shared.ring.release()
    }

    /// True while more minibatches can still be obtained: the worker is
    /// running, or published minibatches remain in the ring.
    pub fn batch_available(&self) -> bool {
        !self.shared.producer_done() || self.shared.ring.ready_len() > 0
    }

    /// Source position a restarted run may resume from without skipping any
    /// frame that has not yet been consumed.
    ///
    /// Early in a staging window, ring-resident minibatches may still carry
    /// frames from the previous window, so the previous window's start is
    /// reported until enough minibatches have been published to rule that
    /// out.
    pub fn checkpoint_frame(&self) -> u64 {
        let resume = *self.shared.resume();
        if resume.batches_into_window < self.shared.ring.capacity() as u64 {
            resume.last_safe
        } else {
            resume.confirmed
        }
    }

    /// Stops the worker and joins it. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.shared.ring.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("batch worker thread panicked");
            }
            debug!("data provider shut down");
        }
    }
}

impl Drop for DataProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ResumeCursor for DataProvider {
    fn checkpoint_frame(&self) -> u64 {
        DataProvider::checkpoint_frame(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FillOutcome, InMemorySource};
    use std::collections::BTreeSet;

    fn test_config(batch_size: usize, staging_batches: usize, ring_capacity: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            staging_batches,
            ring_capacity,
            seed: Some(3),
        }
    }

    fn indexed_source(frames: usize) -> Box<InMemorySource> {
        let features: Vec<f32> = (0..frames).map(|i| i as f32).collect();
        let labels: Vec<f32> = (0..frames).map(|i| -(i as f32)).collect();
        Box::new(InMemorySource::new(1, 1, features, labels).unwrap())
    }

    fn drain(provider: &DataProvider, batch_size: usize) -> Vec<f32> {
        let mut seen = Vec::new();
        loop {
            match provider.get_batch_data(batch_size, true) {
                Ok(batch) => {
                    assert_eq!(batch.frames(), batch_size);
                    seen.extend_from_slice(batch.features());
                }
                Err(StreamError::NotRunning) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            provider.next_batch().unwrap();
        }
        seen
    }

    #[test]
    fn test_streams_full_source() {
        let config = test_config(4, 4, 2);
        let provider = DataProvider::new(&config, indexed_source(64)).unwrap();

        let mut seen = drain(&provider, 4);
        seen.sort_by(f32::total_cmp);
        let want: Vec<f32> = (0..64).map(|i| i as f32).collect();
        assert_eq!(seen, want);
        assert!(!provider.batch_available());
    }

    #[test]
    fn test_start_frame_skips_prefix() {
        let config = test_config(4, 2, 2);
        let provider = DataProvider::with_start_frame(&config, indexed_source(32), 16).unwrap();

        let seen = drain(&provider, 4);
        assert_eq!(seen.len(), 16);
        for value in &seen {
            assert!(*value >= 16.0, "frame {value} precedes the start frame");
        }
    }

    #[test]
    fn test_size_mismatch() {
        let config = test_config(4, 2, 2);
        let provider = DataProvider::new(&config, indexed_source(32)).unwrap();

        let err = provider.get_batch_data(8, true).err();
        match err {
            Some(StreamError::SizeMismatch {
                expected: 4,
                requested: 8,
            }) => {}
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_same_batch_until_next() {
        let config = test_config(4, 2, 2);
        let provider = DataProvider::new(&config, indexed_source(32)).unwrap();

        let first: Vec<f32> = provider.get_batch_data(4, true).unwrap().features().to_vec();
        let again: Vec<f32> = provider.get_batch_data(4, true).unwrap().features().to_vec();
        assert_eq!(first, again);

        provider.next_batch().unwrap();
        let next: Vec<f32> = provider.get_batch_data(4, true).unwrap().features().to_vec();
        assert_ne!(first, next);
    }

    #[test]
    fn test_checkpoint_frame_never_skips_unconsumed_frames() {
        // The no-skip property: every frame below the reported checkpoint
        // frame must already have been consumed, at any point in the
        // stream.
        let config = test_config(4, 4, 2);
        let provider = DataProvider::new(&config, indexed_source(256)).unwrap();

        let mut consumed: BTreeSet<u64> = BTreeSet::new();
        loop {
            let frame = provider.checkpoint_frame();
            for f in 0..frame {
                assert!(consumed.contains(&f), "frame {f} below checkpoint frame {frame} not consumed");
            }

            match provider.get_batch_data(4, true) {
                Ok(batch) => {
                    for value in batch.features() {
                        consumed.insert(*value as u64);
                    }
                }
                Err(StreamError::NotRunning) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            provider.next_batch().unwrap();
        }
        assert_eq!(consumed.len(), 256);
    }

    #[test]
    fn test_restart_from_checkpoint_frame_covers_tail() {
        let config = test_config(4, 4, 2);
        let provider = DataProvider::new(&config, indexed_source(128)).unwrap();

        // Consume part of the stream, then pretend the process died.
        let mut consumed: BTreeSet<u64> = BTreeSet::new();
        for _ in 0..12 {
            let batch = provider.get_batch_data(4, true).unwrap();
            for value in batch.features() {
                consumed.insert(*value as u64);
            }
            drop(batch);
            provider.next_batch().unwrap();
        }
        let resume_frame = provider.checkpoint_frame();
        drop(provider);

        // A restarted provider delivers everything from the resume frame
        // on, so consumed plus the restarted stream covers every frame.
        let restarted =
            DataProvider::with_start_frame(&config, indexed_source(128), resume_frame).unwrap();
        for value in drain(&restarted, 4) {
            consumed.insert(value as u64);
        }
        assert_eq!(consumed.len(), 128);
    }

    #[test]
    fn test_worker_failure_surfaces_to_consumer() {
        struct FailingSource {
            fills: usize,
        }

        impl FrameSource for FailingSource {
            fn feature_dim(&self) -> usize {
                1
            }
            fn label_dim(&self) -> usize {
                0
            }
            fn fill(
                &mut self,
                features: &mut [f32],
                _labels: &mut [f32],
                max_frames: usize,
            ) -> Result<FillOutcome> {
                if self.fills > 0 {
                    return Err(StreamError::backend("failing", "disk on fire"));
                }
                self.fills += 1;
                features[..max_frames].fill(1.0);
                Ok(FillOutcome {
                    frames_read: max_frames,
                    end_of_source: false,
                })
            }
            fn seek(&mut self, _frame: u64) -> Result<()> {
                Ok(())
            }
        }

        let config = test_config(4, 2, 2);
        let provider =
            DataProvider::new(&config, Box::new(FailingSource { fills: 0 })).unwrap();

        let mut saw_backend_error = false;
        loop {
            match provider.get_batch_data(4, true) {
                Ok(_) => provider.next_batch().unwrap(),
                Err(StreamError::Backend { .. }) => {
                    saw_backend_error = true;
                    break;
                }
                Err(StreamError::NotRunning) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_backend_error, "worker failure never reached the consumer");
    }

    #[test]
    fn test_undersized_staging_window_rejected() {
        // With fewer staging batches than ring slots the window turns
        // faster than the ring drains, and the reported checkpoint frame
        // would run ahead of consumption. Construction must fail instead.
        let config = BatchConfig {
            batch_size: 4,
            staging_batches: 1,
            ring_capacity: 4,
            seed: Some(3),
        };
        let err = DataProvider::new(&config, indexed_source(64)).err();
        match err {
            Some(StreamError::Config { .. }) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_feature_dim_rejected() {
        struct DimlessSource;

        impl FrameSource for DimlessSource {
            fn feature_dim(&self) -> usize {
                0
            }
            fn label_dim(&self) -> usize {
                0
            }
            fn fill(
                &mut self,
                _features: &mut [f32],
                _labels: &mut [f32],
                _max_frames: usize,
            ) -> Result<FillOutcome> {
                Ok(FillOutcome {
                    frames_read: 0,
                    end_of_source: true,
                })
            }
            fn seek(&mut self, _frame: u64) -> Result<()> {
                Ok(())
            }
        }

        let config = test_config(4, 2, 2);
        let err = DataProvider::new(&config, Box::new(DimlessSource)).err();
        match err {
            Some(StreamError::Config { .. }) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
