//! Periodic checkpoint coordinator.
//!
//! A background thread wakes on a fixed interval, snapshots trainer progress
//! and model weights together with the stream's safe resume frame, and
//! commits them as the next checkpoint generation. The thread owns the
//! generation counter; ids are dense and strictly increasing within a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::checkpoint::format::CheckpointRecord;
use crate::checkpoint::store::CheckpointStore;
use crate::error::Result;
use crate::trainer::TrainerFacade;

/// Source of the safe resume frame captured in each generation.
///
/// Implemented by the data provider; split out so the coordinator does not
/// depend on the whole streaming engine.
pub trait ResumeCursor: Send + Sync {
    /// Frame number a restarted run may resume from without skipping any
    /// frame still buffered downstream.
    fn checkpoint_frame(&self) -> u64;
}

pub struct CheckpointCoordinator {
    control: Arc<TickControl>,
    handle: Option<JoinHandle<()>>,
}

struct TickControl {
    stopped: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
}

impl CheckpointCoordinator {
    /// Spawns the coordinator thread.
    ///
    /// `next_generation` is one past the recovered generation, or 1 on a
    /// cold start. The first tick fires one full interval after start.
    pub fn start(
        store: Arc<CheckpointStore>,
        trainer: Arc<dyn TrainerFacade>,
        cursor: Arc<dyn ResumeCursor>,
        interval: Duration,
        next_generation: u64,
    ) -> Self {
        let control = Arc::new(TickControl {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name("ckpt-coordinator".to_string())
            .spawn(move || {
                run_loop(
                    &thread_control,
                    &store,
                    trainer.as_ref(),
                    cursor.as_ref(),
                    interval,
                    next_generation,
                );
                thread_control.running.store(false, Ordering::Release);
            })
            .unwrap_or_else(|e| panic!("failed to spawn checkpoint coordinator thread: {e}"));

        info!(interval_ms = interval.as_millis() as u64, next_generation, "checkpoint coordinator started");
        Self {
            control,
            handle: Some(handle),
        }
    }

    /// True while the coordinator thread is alive. A tick failure stops the
    /// thread without touching the rest of the pipeline.
    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::Acquire)
    }

    /// Stops the timer and joins the thread. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let mut stopped = self
                .control
                .stopped
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *stopped = true;
        }
        self.control.wake.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("checkpoint coordinator thread panicked");
            }
        }
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    control: &TickControl,
    store: &CheckpointStore,
    trainer: &dyn TrainerFacade,
    cursor: &dyn ResumeCursor,
    interval: Duration,
    mut generation: u64,
) {
    loop {
        let mut stopped = control.stopped.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            let (guard, timeout) = control
                .wake
                .wait_timeout(stopped, interval)
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
            if timeout.timed_out() {
                break;
            }
        }
        if *stopped {
            return;
        }
        drop(stopped);

        if let Err(e) = tick(store, trainer, cursor, generation) {
            // The trainer keeps going without checkpoints rather than being
            // torn down by a storage fault.
            error!(generation, error = %e, "checkpoint tick failed, coordinator exiting");
            return;
        }
        generation += 1;
    }
}

fn tick(
    store: &CheckpointStore,
    trainer: &dyn TrainerFacade,
    cursor: &dyn ResumeCursor,
    generation: u64,
) -> Result<()> {
    // The resume frame is read before the model snapshot; the stream only
    // moves it forward, so an older frame stays safe for these weights.
    let progress = trainer.progress();
    let resume_frame = cursor.checkpoint_frame();
    let model = trainer.snapshot_model()?;

    debug!(generation, batch = progress.batch, resume_frame, "checkpoint tick");

    let record = CheckpointRecord {
        generation,
        batch: progress.batch,
        epoch: progress.epoch,
        resume_frame,
        model_file: CheckpointStore::model_file_name(generation),
    };
    store.write_generation(&record, &model)
}
