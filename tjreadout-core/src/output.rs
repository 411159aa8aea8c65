//! Output writers for decoded records and built events.
//!
//! Supports CSV tables for hits, triggers and assigned events, a packed
//! binary hit format, and the persisted raw word / meta-index pair.

use crate::correlator::CorrelatedTrigger;
use crate::event_builder::AssignedHit;
use crate::types::{HitRecord, MetaIndexRow, RawWord, TriggerRecord};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Magic bytes opening a binary hit file.
pub const BINARY_MAGIC: &[u8; 8] = b"TJHITS\0\0";

/// Version of the binary hit layout.
pub const BINARY_VERSION: u32 = 1;

/// CSV writer for decoded hits.
pub struct HitCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> HitCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(
            self.writer,
            "column,row,leading_edge,trailing_edge,tot,flag,timestamp"
        )?;
        Ok(())
    }

    pub fn write_hits(&mut self, hits: &[HitRecord]) -> Result<(), OutputError> {
        for hit in hits {
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{}",
                hit.column,
                hit.row,
                hit.leading_edge,
                hit.trailing_edge,
                hit.tot(),
                hit.flag,
                hit.timestamp
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for widened triggers.
pub struct TriggerCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> TriggerCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "trigger_number,narrow_timestamp,timestamp")?;
        Ok(())
    }

    pub fn write_triggers(&mut self, triggers: &[TriggerRecord]) -> Result<(), OutputError> {
        for trigger in triggers {
            writeln!(
                self.writer,
                "{},{},{}",
                trigger.trigger_number, trigger.narrow_timestamp, trigger.timestamp
            )?;
        }
        Ok(())
    }

    /// Writes correlated triggers with the indices of both source records.
    pub fn write_correlated(&mut self, triggers: &[CorrelatedTrigger]) -> Result<(), OutputError> {
        for trigger in triggers {
            writeln!(
                self.writer,
                "{},{},{},{},{}",
                trigger.trigger_number,
                trigger.timestamp,
                trigger.trigger_index,
                trigger.timestamp_index,
                trigger.residual
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for hits assigned to events.
pub struct EventCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> EventCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(
            self.writer,
            "event_index,trigger_number,column,row,leading_edge,trailing_edge,tot,timestamp,delta,is_seed"
        )?;
        Ok(())
    }

    pub fn write_events(&mut self, hits: &[AssignedHit]) -> Result<(), OutputError> {
        for assigned in hits {
            let hit = &assigned.hit;
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{},{},{},{}",
                assigned.event_index,
                assigned.trigger_number,
                hit.column,
                hit.row,
                hit.leading_edge,
                hit.trailing_edge,
                hit.tot(),
                hit.timestamp,
                assigned.delta,
                u8::from(assigned.is_seed)
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Binary output format for hits.
///
/// After a header of magic, version (u32) and hit count (u64), each hit is
/// written as a packed little-endian struct:
/// - column, row, leading_edge, trailing_edge, flag: u8 each
/// - padding: 3 bytes
/// - timestamp: u64
///
/// Total: 16 bytes per hit.
pub struct BinaryWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self, hit_count: u64) -> Result<(), OutputError> {
        self.writer.write_all(BINARY_MAGIC)?;
        self.writer.write_u32::<LittleEndian>(BINARY_VERSION)?;
        self.writer.write_u64::<LittleEndian>(hit_count)?;
        Ok(())
    }

    pub fn write_hits(&mut self, hits: &[HitRecord]) -> Result<(), OutputError> {
        for hit in hits {
            self.writer.write_all(&[
                hit.column,
                hit.row,
                hit.leading_edge,
                hit.trailing_edge,
                hit.flag,
                0,
                0,
                0,
            ])?;
            self.writer.write_u64::<LittleEndian>(hit.timestamp)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads hits written by [`BinaryWriter`].
pub fn read_binary<P: AsRef<Path>>(path: P) -> Result<Vec<HitRecord>, OutputError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != BINARY_MAGIC {
        return Err(OutputError::InvalidFormat("bad magic bytes".to_string()));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != BINARY_VERSION {
        return Err(OutputError::InvalidFormat(format!(
            "unsupported version {}",
            version
        )));
    }
    let count = reader.read_u64::<LittleEndian>()?;

    let mut hits = Vec::with_capacity(count.min(1 << 24) as usize);
    let mut fields = [0u8; 8];
    for _ in 0..count {
        reader.read_exact(&mut fields)?;
        let timestamp = reader.read_u64::<LittleEndian>()?;
        hits.push(HitRecord::new(
            fields[0], fields[1], fields[2], fields[3], fields[4], timestamp,
        ));
    }
    Ok(hits)
}

/// Writes hits to a CSV file.
pub fn write_hits_csv<P: AsRef<Path>>(path: P, hits: &[HitRecord]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = HitCsvWriter::new(file);
    writer.write_header()?;
    writer.write_hits(hits)?;
    writer.flush()?;
    Ok(())
}

/// Writes triggers to a CSV file.
pub fn write_trigger_csv<P: AsRef<Path>>(
    path: P,
    triggers: &[TriggerRecord],
) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = TriggerCsvWriter::new(file);
    writer.write_header()?;
    writer.write_triggers(triggers)?;
    writer.flush()?;
    Ok(())
}

/// Writes assigned hits to a CSV file.
pub fn write_events_csv<P: AsRef<Path>>(path: P, hits: &[AssignedHit]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = EventCsvWriter::new(file);
    writer.write_header()?;
    writer.write_events(hits)?;
    writer.flush()?;
    Ok(())
}

/// Writes hits to a binary file.
pub fn write_binary<P: AsRef<Path>>(path: P, hits: &[HitRecord]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = BinaryWriter::new(file);
    writer.write_header(hits.len() as u64)?;
    writer.write_hits(hits)?;
    writer.flush()?;
    Ok(())
}

/// Persists raw words as little-endian `u32`, the layout read back by
/// [`crate::decoder::read_raw_words`].
pub fn write_raw_words<P: AsRef<Path>>(path: P, words: &[RawWord]) -> Result<(), OutputError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &word in words {
        writer.write_u32::<LittleEndian>(word)?;
    }
    writer.flush()?;
    Ok(())
}

/// Persists a meta-index table as CSV.
pub fn write_index_table<P: AsRef<Path>>(path: P, rows: &[MetaIndexRow]) -> Result<(), OutputError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{read_index_table, read_raw_words};

    #[test]
    fn test_hit_csv_writer() {
        let mut output = Vec::new();
        {
            let mut writer = HitCsvWriter::new(&mut output);
            writer.write_header().unwrap();
            writer
                .write_hits(&[
                    HitRecord::new(59, 175, 57, 0, 0, 8534559536),
                    HitRecord::new(1, 2, 3, 10, 1, 42),
                ])
                .unwrap();
            writer.flush().unwrap();
        }

        let output_str = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output_str.lines().collect();
        assert_eq!(lines[0], "column,row,leading_edge,trailing_edge,tot,flag,timestamp");
        // tot wraps modulo 64
        assert_eq!(lines[1], "59,175,57,0,7,0,8534559536");
        assert_eq!(lines[2], "1,2,3,10,7,1,42");
    }

    #[test]
    fn test_event_csv_writer() {
        let mut output = Vec::new();
        {
            let mut writer = EventCsvWriter::new(&mut output);
            writer
                .write_events(&[AssignedHit {
                    hit: HitRecord::new(4, 5, 1, 3, 0, 120),
                    trigger_number: 9,
                    event_index: 2,
                    delta: 20,
                    is_seed: true,
                }])
                .unwrap();
            writer.flush().unwrap();
        }

        let output_str = String::from_utf8(output).unwrap();
        assert_eq!(output_str.trim(), "2,9,4,5,1,3,2,120,20,1");
    }

    #[test]
    fn test_binary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hits.bin");
        let hits = vec![
            HitRecord::new(59, 175, 57, 0, 0, 8534559536),
            HitRecord::new(111, 223, 63, 63, 3, u64::MAX >> 12),
        ];
        write_binary(&path, &hits).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 20 + 16 * 2);
        assert_eq!(read_binary(&path).unwrap(), hits);
    }

    #[test]
    fn test_binary_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(
            read_binary(&path),
            Err(OutputError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_raw_words_and_index_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("run.raw");
        let index = dir.path().join("run_meta.csv");

        let words = vec![0x1775FC80, 0x2CB30B30, 0x3000001F, 0xFFFF_FFFF];
        write_raw_words(&raw, &words).unwrap();
        assert_eq!(read_raw_words(&raw).unwrap(), words);

        let rows = vec![
            MetaIndexRow {
                index_start: 0,
                index_stop: 3,
                scan_param_id: 0,
            },
            MetaIndexRow {
                index_start: 3,
                index_stop: 4,
                scan_param_id: 1,
            },
        ];
        write_index_table(&index, &rows).unwrap();
        assert_eq!(read_index_table(&index).unwrap(), rows);
    }
}
