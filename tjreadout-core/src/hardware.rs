//! Hardware collaborators of the readout engine.
//!
//! The engine only needs to drain the receive FIFO and poll the discard and
//! error counters. Real hardware implements these traits in the instrument
//! layer; this module provides a file replay source and in-memory doubles.

use crate::decoder::{read_raw_words, DecodeError};
use crate::types::RawWord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Number of hardware discard/error counters polled by the watchdog.
pub const NUM_COUNTERS: usize = 4;

/// The hardware receive buffer.
///
/// Only the acquisition thread calls into the FIFO.
pub trait HardwareFifo: Send {
    /// Drains the words currently held by the FIFO.
    fn read_chunk(&mut self) -> Vec<RawWord>;

    /// Number of words currently held by the FIFO.
    fn occupancy(&self) -> u32;

    /// Clears the FIFO.
    fn reset(&mut self);
}

impl<F: HardwareFifo + ?Sized> HardwareFifo for Box<F> {
    fn read_chunk(&mut self) -> Vec<RawWord> {
        (**self).read_chunk()
    }

    fn occupancy(&self) -> u32 {
        (**self).occupancy()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Read-only hardware discard/error counters.
pub trait ErrorCounters: Send + Sync {
    fn counters(&self) -> [u32; NUM_COUNTERS];
}

/// Replays recorded raw words in fixed-size chunks.
///
/// Resetting rewinds to the start of the recording.
#[derive(Debug, Clone)]
pub struct ReplayFifo {
    words: Vec<RawWord>,
    position: usize,
    chunk_size: usize,
}

impl ReplayFifo {
    pub fn new(words: Vec<RawWord>, chunk_size: usize) -> Self {
        Self {
            words,
            position: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Loads a raw data file of little-endian 32-bit words.
    pub fn from_file<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self, DecodeError> {
        Ok(Self::new(read_raw_words(path)?, chunk_size))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Whether every word has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.position >= self.words.len()
    }
}

impl HardwareFifo for ReplayFifo {
    fn read_chunk(&mut self) -> Vec<RawWord> {
        let end = (self.position + self.chunk_size).min(self.words.len());
        let chunk = self.words[self.position..end].to_vec();
        self.position = end;
        chunk
    }

    fn occupancy(&self) -> u32 {
        (self.words.len() - self.position).min(u32::MAX as usize) as u32
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

/// In-memory FIFO fed through a cloneable [`MemoryFifoHandle`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFifo {
    buffer: Arc<Mutex<VecDeque<RawWord>>>,
}

/// Producer side of a [`MemoryFifo`].
#[derive(Debug, Clone)]
pub struct MemoryFifoHandle {
    buffer: Arc<Mutex<VecDeque<RawWord>>>,
}

impl MemoryFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MemoryFifoHandle {
        MemoryFifoHandle {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl MemoryFifoHandle {
    /// Appends words as if the hardware had received them.
    pub fn push(&self, words: &[RawWord]) {
        self.buffer.lock().extend(words.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

impl HardwareFifo for MemoryFifo {
    fn read_chunk(&mut self) -> Vec<RawWord> {
        self.buffer.lock().drain(..).collect()
    }

    fn occupancy(&self) -> u32 {
        self.buffer.lock().len().min(u32::MAX as usize) as u32
    }

    fn reset(&mut self) {
        self.buffer.lock().clear();
    }
}

/// Counters backed by atomics, settable from any thread.
#[derive(Debug, Clone, Default)]
pub struct AtomicCounters {
    values: Arc<[AtomicU32; NUM_COUNTERS]>,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, index: usize, value: u32) {
        if let Some(counter) = self.values.get(index) {
            counter.store(value, Ordering::Release);
        }
    }

    pub fn clear(&self) {
        for counter in self.values.iter() {
            counter.store(0, Ordering::Release);
        }
    }
}

impl ErrorCounters for AtomicCounters {
    fn counters(&self) -> [u32; NUM_COUNTERS] {
        let mut out = [0; NUM_COUNTERS];
        for (slot, counter) in out.iter_mut().zip(self.values.iter()) {
            *slot = counter.load(Ordering::Acquire);
        }
        out
    }
}
