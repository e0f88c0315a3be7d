//! Background batch assembly worker.
//!
//! One worker thread per provider: it drains the staging window into ring
//! slots one minibatch at a time, reloads and reshuffles the window when it
//! empties, and maintains the pair of resume positions that make a restart
//! from a checkpoint frame-lossless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use crate::error::StreamError;
use crate::ring::BatchRing;
use crate::source::FrameSource;
use crate::staging::StagingBuffer;

/// Resume bookkeeping shared between the worker and the provider.
///
/// `confirmed` is the source position of the current staging window's first
/// frame; `last_safe` is the previous window's. Which one is safe to resume
/// from depends on how far the producer has advanced into the current
/// window, because ring-resident minibatches may still carry frames from the
/// previous one.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResumeState {
    pub last_safe: u64,
    pub confirmed: u64,
    /// Minibatches published since the window last turned.
    pub batches_into_window: u64,
}

/// State shared between the provider facade and the worker thread.
pub(crate) struct WorkerShared {
    pub ring: Arc<BatchRing>,
    resume: Mutex<ResumeState>,
    /// Set when the worker exits; published batches may still be ready.
    producer_done: AtomicBool,
    /// First fatal worker error, surfaced to the consumer exactly once.
    failure: Mutex<Option<StreamError>>,
}

impl WorkerShared {
    pub fn new(ring: Arc<BatchRing>, start_position: u64) -> Self {
        Self {
            ring,
            resume: Mutex::new(ResumeState {
                last_safe: start_position,
                confirmed: start_position,
                batches_into_window: 0,
            }),
            producer_done: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn resume(&self) -> MutexGuard<'_, ResumeState> {
        self.resume.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn producer_done(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
    }

    pub fn take_failure(&self) -> Option<StreamError> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn record_failure(&self, error: StreamError) {
        let mut slot = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

pub(crate) struct WorkerParams {
    pub batch_size: usize,
    pub staging_frames: usize,
    pub start_frame: u64,
    pub seed: Option<u64>,
}

/// Spawns the worker thread. The source must already be positioned at
/// `params.start_frame`.
pub(crate) fn spawn(
    shared: Arc<WorkerShared>,
    mut source: Box<dyn FrameSource>,
    params: WorkerParams,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("batch-worker".to_string())
        .spawn(move || {
            let mut rng = match params.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            if let Err(e) = run(&shared, source.as_mut(), &params, &mut rng) {
                error!(error = %e, "batch worker failed");
                shared.record_failure(e);
            }

            shared.producer_done.store(true, Ordering::Release);
            shared.ring.close();
            debug!("batch worker exited");
        })
        .unwrap_or_else(|e| panic!("failed to spawn batch worker thread: {e}"))
}

fn run(
    shared: &WorkerShared,
    source: &mut dyn FrameSource,
    params: &WorkerParams,
    rng: &mut StdRng,
) -> crate::error::Result<()> {
    let feature_dim = source.feature_dim();
    let label_dim = source.label_dim();
    let mut staging = StagingBuffer::new(
        params.staging_frames,
        feature_dim,
        label_dim,
        params.start_frame,
    );

    staging.load(source)?;
    staging.shuffle(rng);
    info!(
        start_frame = params.start_frame,
        window_frames = params.staging_frames,
        "batch worker started"
    );

    loop {
        if staging.is_empty_window() {
            info!("no frames to stream, batch worker stopping");
            return Ok(());
        }

        let slot_idx = match shared.ring.acquire_for_write(true) {
            Ok(idx) => idx,
            // Closed ring means the provider shut down; not a failure.
            Err(StreamError::NotRunning) => return Ok(()),
            Err(e) => return Err(e),
        };

        let cursor = staging.cursor();
        {
            let mut slot = shared.ring.slot(slot_idx);
            for i in 0..params.batch_size {
                let f_dst = i * feature_dim;
                slot.features[f_dst..f_dst + feature_dim]
                    .copy_from_slice(staging.frame_features(cursor + i));
                if label_dim > 0 {
                    let l_dst = i * label_dim;
                    slot.labels[l_dst..l_dst + label_dim]
                        .copy_from_slice(staging.frame_labels(cursor + i));
                }
            }
            slot.frames = params.batch_size;
        }
        staging.advance(params.batch_size);

        // Turn the window before publishing, so the resume positions
        // recorded with this minibatch already reflect the reload.
        let mut turned = false;
        let mut finished = false;
        if staging.is_drained() {
            if staging.end_of_source() {
                finished = true;
            } else {
                staging.load(source)?;
                if staging.is_empty_window() {
                    finished = true;
                } else {
                    staging.shuffle(rng);
                    turned = true;
                }
            }
        }

        {
            let mut resume = shared.resume();
            resume.batches_into_window += 1;
            if turned {
                resume.last_safe = resume.confirmed;
                resume.confirmed = source.checkpoint_position(staging.window_start());
                resume.batches_into_window = 0;
            }
        }

        shared.ring.publish()?;
        if finished {
            info!("source exhausted, batch worker stopping");
            return Ok(());
        }
    }
}
