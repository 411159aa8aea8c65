//! Stateful raw word decoder.
//!
//! This module drives the word tagger and the fragment assemblers over a
//! stream of raw FIFO words. The decoder state persists across calls, so a
//! logical stream can be decoded in arbitrary chunks.

use crate::config::ConfigError;
use crate::fragment::{HitAssembler, Step, TimestampAssembler};
use crate::parser;
use crate::types::{
    Diagnostic, ErrorKind, Fragment, MetaIndexRow, RawWord, Record, TaggedRecord, TriggerRecord,
    WordTag, NUM_DOMAINS,
};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during raw word decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read meta index table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid raw data: {0}")]
    InvalidFormat(String),

    #[error("Hit timestamp decreased at word {offset}: {previous} -> {current}")]
    NonMonotonic {
        offset: u64,
        previous: u64,
        current: u64,
    },
}

impl DecodeError {
    /// Taxonomy kind of this error, if it is a data error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DecodeError::NonMonotonic { .. } => Some(ErrorKind::NonMonotonicInput),
            _ => None,
        }
    }
}

/// Buffer size for reading raw data (number of 32-bit words).
const READ_BUFFER_SIZE: usize = 1 << 20;

/// Decoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Width of the narrow timestamp field of trigger words (15, 16 or 19)
    pub trigger_timestamp_bits: u32,
    /// Clock domain whose snapshot widens trigger timestamps
    pub trigger_domain: u8,
    /// Emit a record for every completed timestamp triple
    pub emit_timestamp_events: bool,
    /// Emit diagnostic records for trash words and framing errors
    pub emit_diagnostics: bool,
    /// Treat decreasing hit timestamps as fatal
    pub check_monotonic: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            trigger_timestamp_bits: 16,
            trigger_domain: 1,
            emit_timestamp_events: false,
            emit_diagnostics: false,
            check_monotonic: true,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !parser::TRIGGER_TIMESTAMP_WIDTHS.contains(&self.trigger_timestamp_bits) {
            return Err(ConfigError::Invalid(format!(
                "trigger_timestamp_bits must be one of {:?}, got {}",
                parser::TRIGGER_TIMESTAMP_WIDTHS,
                self.trigger_timestamp_bits
            )));
        }
        if self.trigger_domain as usize >= NUM_DOMAINS {
            return Err(ConfigError::Invalid(format!(
                "trigger_domain must be below {}, got {}",
                NUM_DOMAINS, self.trigger_domain
            )));
        }
        Ok(())
    }
}

/// Per-kind error counters of a decode session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub framing: u64,
    pub trash: u64,
    pub non_monotonic: u64,
}

impl ErrorCounts {
    /// Count for one error kind; kinds the decoder never raises count zero.
    pub fn get(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::FramingError => self.framing,
            ErrorKind::TrashWord => self.trash,
            ErrorKind::NonMonotonicInput => self.non_monotonic,
            _ => 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.framing + self.trash + self.non_monotonic
    }
}

/// Decoder state carried across chunk boundaries of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderState {
    config: DecoderConfig,
    hits: HitAssembler,
    timestamps: TimestampAssembler,
    /// Absolute offset of the next word to decode
    word_offset: u64,
    last_hit_timestamp: Option<u64>,
    counts: ErrorCounts,
}

impl Default for DecoderState {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl DecoderState {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            hits: HitAssembler::new(),
            timestamps: TimestampAssembler::new(),
            word_offset: 0,
            last_hit_timestamp: None,
            counts: ErrorCounts::default(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Absolute stream offset of the next word.
    pub fn word_offset(&self) -> u64 {
        self.word_offset
    }

    pub fn counts(&self) -> ErrorCounts {
        self.counts
    }

    pub fn timestamps(&self) -> &TimestampAssembler {
        &self.timestamps
    }

    pub fn hits(&self) -> &HitAssembler {
        &self.hits
    }

    /// Drops partially assembled fragments, keeping counters and snapshots.
    pub fn reset_fragments(&mut self) {
        self.hits.reset();
        self.timestamps.reset_fragments();
    }

    /// Restarts the session: all state except the configuration is cleared.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }
}

/// Result of one [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeStep {
    /// Records completed by the consumed words
    pub records: Vec<Record>,
    /// Number of words consumed, including an offending word
    pub consumed: usize,
    /// Error that stopped decoding early
    pub error: Option<ErrorKind>,
    /// Absolute stream offset of the offending word
    pub error_offset: Option<u64>,
}

/// Decodes words until the end of the slice or the first stopping error.
///
/// Framing errors and non-monotonic hit timestamps stop decoding at the
/// offending word; `consumed` includes that word so the caller resumes with
/// the next one. Trash words are counted and skipped.
pub fn decode(words: &[RawWord], state: &mut DecoderState) -> DecodeStep {
    let mut records = Vec::new();
    let (consumed, stop) = decode_with(words, state, |_, record| records.push(record));
    DecodeStep {
        records,
        consumed,
        error: stop.map(|s| s.kind()),
        error_offset: stop.map(|s| s.offset()),
    }
}

/// Reason the step loop stopped before the end of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Framing {
        offset: u64,
    },
    NonMonotonic {
        offset: u64,
        previous: u64,
        current: u64,
    },
}

impl Stop {
    fn kind(&self) -> ErrorKind {
        match self {
            Stop::Framing { .. } => ErrorKind::FramingError,
            Stop::NonMonotonic { .. } => ErrorKind::NonMonotonicInput,
        }
    }

    fn offset(&self) -> u64 {
        match *self {
            Stop::Framing { offset } | Stop::NonMonotonic { offset, .. } => offset,
        }
    }
}

/// Core step loop; `emit` receives the absolute offset of the completing word.
fn decode_with<F>(
    words: &[RawWord],
    state: &mut DecoderState,
    mut emit: F,
) -> (usize, Option<Stop>)
where
    F: FnMut(u64, Record),
{
    let config = state.config;

    for (index, &word) in words.iter().enumerate() {
        let offset = state.word_offset;
        state.word_offset += 1;

        let tag = parser::tag_word(word);
        match tag {
            WordTag::HitWord0 | WordTag::HitWord1 | WordTag::HitWord2 => {
                let fragment = match tag {
                    WordTag::HitWord0 => Fragment::Low,
                    WordTag::HitWord1 => Fragment::Mid,
                    _ => Fragment::High,
                };
                match state.hits.push(fragment, word) {
                    Step::Pending => {}
                    Step::Complete(hit) => {
                        if config.check_monotonic {
                            if let Some(previous) = state.last_hit_timestamp {
                                if hit.timestamp < previous {
                                    state.counts.non_monotonic += 1;
                                    warn!(
                                        offset,
                                        previous,
                                        current = hit.timestamp,
                                        "Hit timestamp decreased"
                                    );
                                    return (
                                        index + 1,
                                        Some(Stop::NonMonotonic {
                                            offset,
                                            previous,
                                            current: hit.timestamp,
                                        }),
                                    );
                                }
                            }
                        }
                        state.last_hit_timestamp = Some(hit.timestamp);
                        emit(offset, Record::Hit(hit));
                    }
                    Step::Framing { expected } => {
                        state.counts.framing += 1;
                        debug!(offset, word, ?expected, "Hit framing error");
                        if config.emit_diagnostics {
                            emit(offset, Record::Diagnostic(Diagnostic::Framing { word, tag }));
                        }
                        return (index + 1, Some(Stop::Framing { offset }));
                    }
                }
            }

            WordTag::Timestamp { domain, fragment } => {
                match state.timestamps.push(domain, fragment, word) {
                    Step::Pending => {}
                    Step::Complete(event) => {
                        if config.emit_timestamp_events {
                            emit(offset, Record::Timestamp(event));
                        }
                    }
                    Step::Framing { expected } => {
                        state.counts.framing += 1;
                        debug!(offset, word, domain, ?expected, "Timestamp framing error");
                        if config.emit_diagnostics {
                            emit(offset, Record::Diagnostic(Diagnostic::Framing { word, tag }));
                        }
                        return (index + 1, Some(Stop::Framing { offset }));
                    }
                }
            }

            WordTag::Trigger => {
                let bits = config.trigger_timestamp_bits;
                let narrow = parser::trigger_get_timestamp(word, bits);
                let snapshot = state.timestamps.counter(config.trigger_domain).snapshot();
                emit(
                    offset,
                    Record::Trigger(TriggerRecord {
                        trigger_number: parser::trigger_get_number(word, bits),
                        narrow_timestamp: narrow,
                        timestamp: parser::widen_timestamp(snapshot, narrow, bits),
                    }),
                );
            }

            WordTag::Trash => {
                state.counts.trash += 1;
                if config.emit_diagnostics {
                    emit(offset, Record::Diagnostic(Diagnostic::Trash { word }));
                }
            }
        }
    }

    (words.len(), None)
}

/// Looks up the scan parameter whose `[index_start, index_stop)` holds `offset`.
///
/// `table` must be sorted by `index_start`.
pub fn lookup_scan_param(table: &[MetaIndexRow], offset: u64) -> Option<u32> {
    let upper = table.partition_point(|row| row.index_start <= offset);
    let row = table.get(upper.checked_sub(1)?)?;
    (offset < row.index_stop).then_some(row.scan_param_id)
}

/// Raw word decoder for one logical stream.
///
/// Wraps [`decode`] and recovers from framing errors by resuming with the
/// next word.
#[derive(Debug, Default)]
pub struct RawWordDecoder {
    state: DecoderState,
}

impl RawWordDecoder {
    /// Creates a new decoder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            state: DecoderState::new(config),
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Error counters of the current session.
    pub fn error_counts(&self) -> ErrorCounts {
        self.state.counts
    }

    /// Restarts the session.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Decodes a chunk of words, continuing the current session.
    pub fn decode(&mut self, words: &[RawWord]) -> Result<Vec<Record>, DecodeError> {
        let mut records = Vec::new();
        self.decode_into(words, &mut records)?;
        Ok(records)
    }

    /// Decodes a chunk of words, appending records to `records`.
    ///
    /// Records completed before a non-monotonic hit are kept in `records`.
    pub fn decode_into(
        &mut self,
        words: &[RawWord],
        records: &mut Vec<Record>,
    ) -> Result<(), DecodeError> {
        self.run(words, |_, record| records.push(record))
    }

    /// Decodes a persisted batch, tagging records with their scan parameter.
    ///
    /// Table offsets are absolute stream offsets, so the batch should start a
    /// fresh session.
    pub fn decode_tagged(
        &mut self,
        words: &[RawWord],
        index_table: &[MetaIndexRow],
    ) -> Result<Vec<TaggedRecord>, DecodeError> {
        let table: Cow<[MetaIndexRow]> = if index_table
            .windows(2)
            .all(|pair| pair[0].index_start <= pair[1].index_start)
        {
            Cow::Borrowed(index_table)
        } else {
            let mut sorted = index_table.to_vec();
            sorted.sort_by_key(|row| row.index_start);
            Cow::Owned(sorted)
        };

        let mut tagged = Vec::new();
        self.run(words, |word_offset, record| {
            tagged.push(TaggedRecord {
                word_offset,
                scan_param_id: lookup_scan_param(&table, word_offset),
                record,
            })
        })?;
        Ok(tagged)
    }

    fn run<F>(&mut self, words: &[RawWord], mut emit: F) -> Result<(), DecodeError>
    where
        F: FnMut(u64, Record),
    {
        let mut remaining = words;
        while !remaining.is_empty() {
            let (consumed, stop) = decode_with(remaining, &mut self.state, &mut emit);
            remaining = &remaining[consumed..];
            if let Some(Stop::NonMonotonic {
                offset,
                previous,
                current,
            }) = stop
            {
                return Err(DecodeError::NonMonotonic {
                    offset,
                    previous,
                    current,
                });
            }
        }
        Ok(())
    }

    /// Decodes a raw data file of little-endian 32-bit words.
    pub fn decode_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<Record>, DecodeError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let mut bytes = vec![0u8; READ_BUFFER_SIZE * 4];
        let mut words = vec![0u32; READ_BUFFER_SIZE];
        let mut records = Vec::new();

        loop {
            let n_bytes = fill_buffer(&mut reader, &mut bytes)?;
            if n_bytes == 0 {
                break;
            }
            if n_bytes % 4 != 0 {
                return Err(DecodeError::InvalidFormat(format!(
                    "file length is not a multiple of 4 bytes ({} trailing)",
                    n_bytes % 4
                )));
            }
            let n_words = n_bytes / 4;
            LittleEndian::read_u32_into(&bytes[..n_bytes], &mut words[..n_words]);
            self.decode_into(&words[..n_words], &mut records)?;
        }

        Ok(records)
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill_buffer<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Reads a whole raw data file of little-endian 32-bit words.
pub fn read_raw_words<P: AsRef<Path>>(path: P) -> Result<Vec<RawWord>, DecodeError> {
    let bytes = std::fs::read(path.as_ref())?;
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::InvalidFormat(format!(
            "file length {} is not a multiple of 4 bytes",
            bytes.len()
        )));
    }
    let mut words = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(&bytes, &mut words);
    Ok(words)
}

/// Reads a meta index table from CSV with the columns
/// `index_start,index_stop,scan_param_id`.
pub fn read_index_table<P: AsRef<Path>>(path: P) -> Result<Vec<MetaIndexRow>, DecodeError> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
