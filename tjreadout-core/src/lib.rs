//! Readout and decoding engine for a 112 x 224 monolithic pixel detector.
//!
//! The detector's FPGA streams 32-bit words into a hardware FIFO. This crate
//! turns that stream into typed, time-ordered records (pixel hits, clock
//! domain timestamps, triggers), aligns the independently clocked trigger and
//! timestamp streams, and assigns hits to triggered events.
//!
//! # Example
//!
//! ```no_run
//! use tjreadout_core::decoder::RawWordDecoder;
//! use tjreadout_core::types::Record;
//!
//! let mut decoder = RawWordDecoder::new();
//! let records = decoder.decode_file("run.raw").unwrap();
//!
//! let hits = records.iter().filter_map(Record::as_hit).count();
//! println!("Decoded {} hits", hits);
//! println!("Framing errors: {}", decoder.error_counts().framing);
//! ```
//!
//! # Components
//!
//! - [`decoder`]: resumable raw word decoding with framing recovery
//! - [`correlator`]: wrap-aware alignment of two counter streams
//! - [`event_builder`]: window assignment of hits to triggers
//! - [`readout`]: continuous acquisition with consumer and watchdog threads
//! - [`output`]: CSV and binary writers

pub mod config;
pub mod correlator;
pub mod decoder;
pub mod event_builder;
pub mod fragment;
pub mod hardware;
pub mod output;
pub mod parser;
pub mod readout;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use correlator::{CorrelatedTrigger, CorrelationError, CorrelatorConfig, StreamCorrelator};
pub use decoder::{decode, DecodeError, DecodeStep, DecoderConfig, DecoderState, RawWordDecoder};
pub use event_builder::{AssignedHit, BuilderConfig, BuiltEvents, EventBuilder};
pub use hardware::{ErrorCounters, HardwareFifo, ReplayFifo};
pub use output::OutputError;
pub use readout::{ReadoutChunk, ReadoutEngine, ReadoutError, ReadoutOptions};
pub use types::{ErrorKind, HitRecord, RawWord, Record, TimestampEvent, TriggerRecord};
