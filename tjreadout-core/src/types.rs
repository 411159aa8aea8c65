//! Core record types for TJ readout data.
//!
//! This module defines the decoded records, the word tags recognised by the
//! tagger, and the error taxonomy shared by the decoder, correlator and
//! readout engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw 32-bit word as drained from the hardware FIFO.
pub type RawWord = u32;

/// Number of independent timestamp clock domains.
pub const NUM_DOMAINS: usize = 4;

/// Flag bit set by the hardware on hits it considers noisy.
pub const FLAG_NOISE: u8 = 0x1;

/// Flag bit marking a non-seed hit within a cluster sharing one raw timestamp.
pub const FLAG_DUPLICATE: u8 = 0x2;

/// A decoded pixel hit.
///
/// Hits are assembled from three consecutive hit words: a feature word with
/// the pixel address and edge phases, followed by two words carrying the
/// 52-bit hit timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct HitRecord {
    /// Pixel column (0-111)
    pub column: u8,
    /// Pixel row (0-223)
    pub row: u8,
    /// Leading edge phase (0-63)
    pub leading_edge: u8,
    /// Trailing edge phase (0-63)
    pub trailing_edge: u8,
    /// Noise and duplicate markers, see [`FLAG_NOISE`] and [`FLAG_DUPLICATE`]
    pub flag: u8,
    /// Hit timestamp in clock ticks
    pub timestamp: u64,
}

impl HitRecord {
    /// Creates a new hit record.
    #[inline]
    pub fn new(
        column: u8,
        row: u8,
        leading_edge: u8,
        trailing_edge: u8,
        flag: u8,
        timestamp: u64,
    ) -> Self {
        Self {
            column,
            row,
            leading_edge,
            trailing_edge,
            flag,
            timestamp,
        }
    }

    /// Time over threshold, computed modulo the 6-bit edge counter.
    #[inline]
    pub fn tot(&self) -> u8 {
        self.trailing_edge.wrapping_sub(self.leading_edge) & 0x3F
    }

    /// Whether the hardware marked this hit as noise.
    #[inline]
    pub fn is_noise(&self) -> bool {
        self.flag & FLAG_NOISE != 0
    }

    /// Whether this hit is a non-seed member of a coincident cluster.
    #[inline]
    pub fn is_duplicate(&self) -> bool {
        self.flag & FLAG_DUPLICATE != 0
    }
}

/// A completed timestamp triple for one clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampEvent {
    /// Clock domain (0-3)
    pub domain: u8,
    /// Number of triples completed in this domain so far, including this one
    pub count: u64,
    /// Assembled counter value
    pub value: u64,
    /// Difference to the previous snapshot of the same domain
    pub delta: u64,
}

/// A trigger word widened to a full-width timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Rolling trigger number
    pub trigger_number: u32,
    /// Narrow timestamp field as carried in the trigger word
    pub narrow_timestamp: u32,
    /// Timestamp widened against the trigger domain snapshot
    pub timestamp: u64,
}

/// Diagnostic records emitted on request for malformed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A word with no recognised tag.
    Trash { word: RawWord },
    /// A word that arrived out of fragment order.
    Framing { word: RawWord, tag: WordTag },
}

/// Any record produced by the raw word decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Hit(HitRecord),
    Timestamp(TimestampEvent),
    Trigger(TriggerRecord),
    Diagnostic(Diagnostic),
}

impl Record {
    /// Returns the hit if this record is one.
    pub fn as_hit(&self) -> Option<&HitRecord> {
        match self {
            Record::Hit(hit) => Some(hit),
            _ => None,
        }
    }

    /// Returns the trigger if this record is one.
    pub fn as_trigger(&self) -> Option<&TriggerRecord> {
        match self {
            Record::Trigger(trigger) => Some(trigger),
            _ => None,
        }
    }

    /// Returns the timestamp event if this record is one.
    pub fn as_timestamp(&self) -> Option<&TimestampEvent> {
        match self {
            Record::Timestamp(ts) => Some(ts),
            _ => None,
        }
    }
}

/// Position of a word within a three-word fragment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fragment {
    Low,
    Mid,
    High,
}

/// Tag assigned to a raw word by its high-order bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordTag {
    /// Hit feature word: column, row, edges, flag (0x1)
    HitWord0,
    /// Hit timestamp bits 27..0 (0x2)
    HitWord1,
    /// Hit timestamp bits 51..28 (0x3)
    HitWord2,
    /// Timestamp fragment of a clock domain (0x4-0x7)
    Timestamp { domain: u8, fragment: Fragment },
    /// Trigger word, top bit set
    Trigger,
    /// Unrecognised word
    Trash,
}

/// A row of the persisted meta-index table.
///
/// Rows map half-open word ranges `[index_start, index_stop)` of a raw data
/// file to the scan parameter step that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaIndexRow {
    pub index_start: u64,
    pub index_stop: u64,
    pub scan_param_id: u32,
}

/// A decoded record tagged with its source position and scan parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedRecord {
    /// Absolute stream offset of the word that completed the record
    pub word_offset: u64,
    /// Scan parameter id whose index range contains `word_offset`
    pub scan_param_id: Option<u32>,
    pub record: Record,
}

/// Error taxonomy shared across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Fragment sequence violated; recoverable by state reset
    FramingError,
    /// Unrecognised word; recoverable, counted
    TrashWord,
    /// Correlator found no valid head alignment
    DesyncError,
    /// Timestamps decreased within a session
    NonMonotonicInput,
    /// Acquisition saw no data for the configured duration
    NoDataTimeout,
    /// Graceful shutdown exceeded its deadline
    StopTimeout,
}

impl ErrorKind {
    /// Whether decoding continues after an error of this kind.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::FramingError | ErrorKind::TrashWord)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::FramingError => "framing error",
            ErrorKind::TrashWord => "trash word",
            ErrorKind::DesyncError => "desynchronization",
            ErrorKind::NonMonotonicInput => "non-monotonic input",
            ErrorKind::NoDataTimeout => "no data timeout",
            ErrorKind::StopTimeout => "stop timeout",
        };
        f.write_str(name)
    }
}
