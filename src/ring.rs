//! Fixed-capacity minibatch ring shared by one producer and one consumer.
//!
//! The ring decouples minibatch assembly from consumption: the worker fills
//! the next slot while the training loop is still using the current one.
//! Slot contents are handed off by reference, never copied on the hot path.
//!
//! One mutex guards the counters and indices; two condition variables
//! ("ready" for the consumer, "free" for the producer) carry the hand-off.
//! Slot payloads live behind per-slot mutexes that are only ever locked
//! uncontended, because the protocol guarantees a slot is either checked out
//! to exactly one side or idle.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{Result, StreamError};

/// One reusable minibatch buffer.
///
/// Slots are allocated once at ring construction and reused for the process
/// lifetime.
#[derive(Debug)]
pub struct BatchSlot {
    /// `frames * feature_dim` feature values.
    pub features: Vec<f32>,
    /// `frames * label_dim` label values; empty for unlabeled sources.
    pub labels: Vec<f32>,
    /// Frames currently stored in this slot.
    pub frames: usize,
}

#[derive(Debug)]
struct RingState {
    read_idx: usize,
    write_idx: usize,
    ready: usize,
    free: usize,
    closed: bool,
}

pub struct BatchRing {
    state: Mutex<RingState>,
    ready_cv: Condvar,
    free_cv: Condvar,
    slots: Vec<Mutex<BatchSlot>>,
    capacity: usize,
}

impl BatchRing {
    /// Creates a ring of `capacity` slots sized for `batch_size` frames.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `capacity < 2`: with a single slot
    /// the in-use and being-filled minibatches cannot overlap.
    pub fn new(
        capacity: usize,
        batch_size: usize,
        feature_dim: usize,
        label_dim: usize,
    ) -> Result<Self> {
        if capacity < 2 {
            return Err(StreamError::config("ring capacity must be at least 2"));
        }

        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(BatchSlot {
                    features: vec![0.0; batch_size * feature_dim],
                    labels: vec![0.0; batch_size * label_dim],
                    frames: 0,
                })
            })
            .collect();

        Ok(Self {
            state: Mutex::new(RingState {
                read_idx: 0,
                write_idx: 0,
                ready: 0,
                free: capacity,
                closed: false,
            }),
            ready_cv: Condvar::new(),
            free_cv: Condvar::new(),
            slots,
            capacity,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for a ready slot and returns its index without advancing the
    /// read position. Repeated calls without an intervening [`release`]
    /// return the same slot.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` if `blocking` is false and no slot is ready.
    /// - `NotRunning` once the ring is closed and drained.
    ///
    /// [`release`]: BatchRing::release
    pub fn acquire_for_read(&self, blocking: bool) -> Result<usize> {
        let mut state = self.lock_state();
        loop {
            if state.ready > 0 {
                return Ok(state.read_idx);
            }
            if state.closed {
                return Err(StreamError::NotRunning);
            }
            if !blocking {
                return Err(StreamError::WouldBlock);
            }
            state = self
                .ready_cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Consumer signals it is done with the current read slot.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if no slot is checked out for reading.
    pub fn release(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.ready == 0 {
            return Err(StreamError::protocol(
                "release called with no slot checked out",
            ));
        }
        state.ready -= 1;
        state.free += 1;
        state.read_idx = (state.read_idx + 1) % self.capacity;
        debug_assert_eq!(state.ready + state.free, self.capacity);
        drop(state);
        self.free_cv.notify_one();
        Ok(())
    }

    /// Waits for a free slot and returns its index without advancing the
    /// write position. Producer-side mirror of [`acquire_for_read`].
    ///
    /// [`acquire_for_read`]: BatchRing::acquire_for_read
    pub fn acquire_for_write(&self, blocking: bool) -> Result<usize> {
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(StreamError::NotRunning);
            }
            if state.free > 0 {
                return Ok(state.write_idx);
            }
            if !blocking {
                return Err(StreamError::WouldBlock);
            }
            state = self.free_cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Producer marks the current write slot ready for consumption.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if no slot is checked out for writing.
    pub fn publish(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.free == 0 {
            return Err(StreamError::protocol(
                "publish called with no slot checked out",
            ));
        }
        state.free -= 1;
        state.ready += 1;
        state.write_idx = (state.write_idx + 1) % self.capacity;
        debug_assert_eq!(state.ready + state.free, self.capacity);
        drop(state);
        self.ready_cv.notify_one();
        Ok(())
    }

    /// Locks a slot's payload. The caller must hold the slot via
    /// `acquire_for_read` or `acquire_for_write`; the lock is then
    /// uncontended.
    pub fn slot(&self, idx: usize) -> MutexGuard<'_, BatchSlot> {
        self.slots[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Closes the ring and broadcast-wakes every waiter on both conditions,
    /// so no thread can hang in shutdown. Already-ready slots remain
    /// consumable.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        drop(state);
        self.ready_cv.notify_all();
        self.free_cv.notify_all();
    }

    /// Number of slots currently ready for the consumer.
    pub fn ready_len(&self) -> usize {
        self.lock_state().ready
    }

    /// Ring capacity in slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(ready, free)` counts, for invariant checks.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.ready, state.free)
    }
}
