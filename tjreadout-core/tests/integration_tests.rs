//! Integration tests for decoding, correlation, event building and readout.
//!
//! Most tests run on synthetic streams. The recorded-run test requires the
//! test_data directory to contain a raw file and skips otherwise.
//! Run with: cargo test --test integration_tests

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tjreadout_core::correlator::ExtraRecord;
use tjreadout_core::decoder::{read_index_table, read_raw_words};
use tjreadout_core::hardware::MemoryFifo;
use tjreadout_core::parser::{encode_hit, encode_timestamp, encode_trigger};
use tjreadout_core::readout::{CallbackResult, DataCallback, ErrorCallback, StopOutcome};
use tjreadout_core::types::MetaIndexRow;
use tjreadout_core::{
    decode, output, BuilderConfig, CorrelatorConfig, DecoderConfig, DecoderState, ErrorKind,
    EventBuilder, HitRecord, RawWordDecoder, ReadoutChunk, ReadoutEngine, ReadoutError,
    ReadoutOptions, Record, ReplayFifo, StreamCorrelator,
};

const TEST_FILE: &str = "test_data/run.raw";

const REFERENCE_WORDS: [u32; 3] = [0x1775FC80, 0x2CB30B30, 0x3000001F];

fn reference_hit() -> HitRecord {
    HitRecord::new(59, 175, 57, 0, 0, 8534559536)
}

fn hits_of(records: &[Record]) -> Vec<HitRecord> {
    records.iter().filter_map(Record::as_hit).copied().collect()
}

/// Ten triggers with two hits each, preceded by an unmatched timestamp and
/// a stray hit outside every trigger window.
fn triggered_stream() -> Vec<u32> {
    let mut words = Vec::new();
    words.extend_from_slice(&encode_timestamp(1, 5_000));
    words.extend_from_slice(&encode_hit(&HitRecord::new(3, 4, 1, 2, 0, 6_000)));
    for k in 0..10u64 {
        let t = 10_000 + k * 1_000;
        words.extend_from_slice(&encode_timestamp(1, t));
        words.push(encode_trigger(k as u32, (t & 0xFFFF) as u32, 16));
        words.extend_from_slice(&encode_hit(&HitRecord::new(10, 20, 5, 9, 0, t + 5)));
        words.extend_from_slice(&encode_hit(&HitRecord::new(11, 20, 7, 9, 0, t + 20)));
    }
    words
}

#[test]
fn test_decode_real_file() {
    let test_path = Path::new(TEST_FILE);
    if !test_path.exists() {
        eprintln!("Skipping test: test file not found at {}", TEST_FILE);
        return;
    }

    let mut decoder = RawWordDecoder::new();
    let records = decoder
        .decode_file(test_path)
        .expect("Failed to decode file");

    let hits = hits_of(&records);
    assert!(!hits.is_empty());
    for hit in &hits {
        assert!(hit.column < 112);
        assert!(hit.row < 224);
    }
    for pair in hits.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn test_reference_triple() {
    let mut state = DecoderState::default();
    let step = decode(&REFERENCE_WORDS, &mut state);

    assert_eq!(step.consumed, 3);
    assert_eq!(step.error, None);
    assert_eq!(step.records, vec![Record::Hit(reference_hit())]);
}

#[test]
fn test_dropped_middle_word() {
    let first = encode_hit(&HitRecord::new(1, 1, 0, 0, 0, 100));
    let second = encode_hit(&HitRecord::new(2, 2, 0, 0, 0, 200));
    let words = [first[0], first[2], second[0], second[1], second[2]];

    let mut decoder = RawWordDecoder::new();
    let records = decoder.decode(&words).unwrap();

    assert_eq!(hits_of(&records), vec![HitRecord::new(2, 2, 0, 0, 0, 200)]);
    assert_eq!(decoder.error_counts().framing, 1);
    assert_eq!(decoder.error_counts().get(ErrorKind::FramingError), 1);
}

#[test]
fn test_resume_at_every_split_point() {
    let mut words = triggered_stream();
    // A trash word and a broken timestamp triple inside the stream
    words.insert(7, 0x0123_4567);
    words.insert(20, encode_timestamp(2, 77)[1]);

    let config = DecoderConfig {
        emit_timestamp_events: true,
        emit_diagnostics: true,
        ..Default::default()
    };
    let mut whole = RawWordDecoder::with_config(config);
    let expected = whole.decode(&words).unwrap();
    let expected_counts = whole.error_counts();
    assert_eq!(expected_counts.trash, 1);
    assert_eq!(expected_counts.framing, 1);

    for split in 0..=words.len() {
        let mut decoder = RawWordDecoder::with_config(config);
        let mut records = decoder.decode(&words[..split]).unwrap();
        records.extend(decoder.decode(&words[split..]).unwrap());

        assert_eq!(records, expected, "split at {}", split);
        assert_eq!(decoder.error_counts(), expected_counts, "split at {}", split);
    }
}

#[test]
fn test_step_function_resume() {
    let hit = encode_hit(&HitRecord::new(5, 6, 1, 2, 0, 1_000));
    // Hit word 1 without a preceding word 0
    let words = [hit[1], hit[0], hit[1], hit[2]];

    let mut state = DecoderState::default();
    let first = decode(&words, &mut state);
    assert_eq!(first.consumed, 1);
    assert_eq!(first.error, Some(ErrorKind::FramingError));
    assert_eq!(first.error_offset, Some(0));
    assert!(first.records.is_empty());

    let second = decode(&words[first.consumed..], &mut state);
    assert_eq!(second.consumed, 3);
    assert_eq!(second.error, None);
    assert_eq!(
        second.records,
        vec![Record::Hit(HitRecord::new(5, 6, 1, 2, 0, 1_000))]
    );
    assert_eq!(state.counts().framing, 1);
}

#[test]
fn test_synthetic_hits_survive_encoding() {
    let hits = vec![
        HitRecord::new(0, 0, 0, 0, 0, 0),
        reference_hit(),
        HitRecord::new(111, 223, 63, 63, 1, (1u64 << 52) - 1),
    ];
    let words: Vec<u32> = hits.iter().flat_map(encode_hit).collect();

    let mut decoder = RawWordDecoder::new();
    assert_eq!(hits_of(&decoder.decode(&words).unwrap()), hits);
}

/// Hits over the column and row boundaries with every edge phase, stamped
/// with sorted pseudo-random 52-bit timestamps.
fn hit_sweep() -> Vec<HitRecord> {
    let mut seed = 0x2545_F491_4F6C_DD1Du64;
    let mut timestamps: Vec<u64> = (0..5 * 5 * 64)
        .map(|_| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            seed >> 12
        })
        .collect();
    timestamps.sort_unstable();

    let mut hits = Vec::with_capacity(timestamps.len());
    let mut stamps = timestamps.into_iter();
    for column in [0u8, 1, 55, 110, 111] {
        for row in [0u8, 1, 111, 222, 223] {
            for phase in 0..64u8 {
                if let Some(timestamp) = stamps.next() {
                    hits.push(HitRecord::new(
                        column,
                        row,
                        phase,
                        63 - phase,
                        phase & 1,
                        timestamp,
                    ));
                }
            }
        }
    }
    hits
}

#[test]
fn test_hit_sweep_decodes_exactly_and_in_order() {
    let hits = hit_sweep();
    assert_eq!(hits.len(), 1600);
    assert!(hits.iter().all(|h| h.timestamp < 1u64 << 52));
    let words: Vec<u32> = hits.iter().flat_map(encode_hit).collect();

    let mut decoder = RawWordDecoder::new();
    let decoded = hits_of(&decoder.decode(&words).unwrap());
    assert_eq!(decoded, hits);
    assert!(decoded.windows(2).all(|p| p[0].timestamp <= p[1].timestamp));
    assert_eq!(decoder.error_counts().framing, 0);

    // Same stream through chunk boundaries that split hit triples
    let mut chunked = RawWordDecoder::new();
    let mut records = Vec::new();
    for chunk in words.chunks(7) {
        chunked.decode_into(chunk, &mut records).unwrap();
    }
    assert_eq!(hits_of(&records), hits);
}

#[test]
fn test_hit_sweep_flags_decreasing_timestamp() {
    let mut hits = hit_sweep();
    let at = 800;
    hits[at].timestamp = hits[at - 1].timestamp - 1;
    let words: Vec<u32> = hits.iter().flat_map(encode_hit).collect();

    let mut decoder = RawWordDecoder::new();
    let mut records = Vec::new();
    let err = decoder.decode_into(&words, &mut records).unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::NonMonotonicInput));
    assert_eq!(decoder.error_counts().non_monotonic, 1);
    assert_eq!(hits_of(&records), hits[..at].to_vec());
}

#[test]
fn test_trigger_wraparound_for_all_widths() {
    for bits in [15u32, 16, 19] {
        let field = (1u64 << bits) - 1;
        let snapshot = (5u64 << bits) | (field - 2);

        let mut words = encode_timestamp(1, snapshot).to_vec();
        // Narrow field below the snapshot's low bits: the counter wrapped
        words.push(encode_trigger(7, 3, bits));
        // Narrow field above: no wrap
        words.push(encode_trigger(8, (field - 1) as u32, bits));

        let mut decoder = RawWordDecoder::with_config(DecoderConfig {
            trigger_timestamp_bits: bits,
            ..Default::default()
        });
        let records = decoder.decode(&words).unwrap();
        let triggers: Vec<_> = records.iter().filter_map(Record::as_trigger).collect();

        assert_eq!(triggers.len(), 2, "width {}", bits);
        assert_eq!(triggers[0].trigger_number, 7);
        assert_eq!(triggers[0].timestamp, (6u64 << bits) | 3, "width {}", bits);
        assert_eq!(triggers[1].trigger_number, 8);
        assert_eq!(triggers[1].timestamp, (5u64 << bits) | (field - 1));
    }
}

#[test]
fn test_non_monotonic_hits_are_fatal() {
    let mut words = encode_hit(&HitRecord::new(1, 1, 0, 0, 0, 500)).to_vec();
    words.extend_from_slice(&encode_hit(&HitRecord::new(1, 1, 0, 0, 0, 400)));

    let mut decoder = RawWordDecoder::new();
    let err = decoder.decode(&words).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NonMonotonicInput));
    assert_eq!(decoder.error_counts().non_monotonic, 1);
}

#[test]
fn test_correlate_and_build_pipeline() {
    let mut decoder = RawWordDecoder::with_config(DecoderConfig {
        emit_timestamp_events: true,
        ..Default::default()
    });
    let records = decoder.decode(&triggered_stream()).unwrap();

    let triggers: Vec<_> = records.iter().filter_map(Record::as_trigger).copied().collect();
    let timestamps: Vec<_> = records
        .iter()
        .filter_map(Record::as_timestamp)
        .filter(|ts| ts.domain == 1)
        .copied()
        .collect();
    assert_eq!(triggers.len(), 10);
    assert_eq!(timestamps.len(), 11);

    let correlator = StreamCorrelator::new(CorrelatorConfig {
        wrap_bits: 64,
        offset: 0,
        window: 16,
    })
    .unwrap();
    let (correlated, correlation) = correlator
        .correlate_triggers(&triggers, &timestamps)
        .unwrap();
    assert_eq!(correlation.extra, Some(ExtraRecord::B(1)));
    assert_eq!(correlated.len(), 10);
    for (k, trigger) in correlated.iter().enumerate() {
        assert_eq!(trigger.trigger_number, k as u32);
        assert_eq!(trigger.timestamp, 10_000 + k as u64 * 1_000);
        assert_eq!(trigger.residual, 0);
    }

    let builder = EventBuilder::new(BuilderConfig {
        lower: 0,
        upper: 100,
        mark_seeds: true,
    })
    .unwrap();
    let built = builder.build_marked(&correlated, &hits_of(&records));

    assert_eq!(built.dropped, 1);
    assert_eq!(built.events, 10);
    assert_eq!(built.hits.len(), 20);
    for assigned in &built.hits {
        assert!((0..=100).contains(&assigned.delta));
        assert!(assigned.is_seed);
        assert_eq!(assigned.trigger_number as usize, assigned.event_index);
    }
}

#[test]
fn test_file_decode_with_index_table() {
    let dir = tempfile::tempdir().unwrap();
    let raw_path = dir.path().join("scan.raw");
    let index_path = dir.path().join("scan_meta.csv");

    let mut words = Vec::new();
    for i in 0..4u64 {
        words.extend_from_slice(&encode_hit(&HitRecord::new(1, i as u8, 0, 0, 0, i * 10)));
    }
    output::write_raw_words(&raw_path, &words).unwrap();
    output::write_index_table(
        &index_path,
        &[
            MetaIndexRow {
                index_start: 0,
                index_stop: 6,
                scan_param_id: 0,
            },
            MetaIndexRow {
                index_start: 6,
                index_stop: 12,
                scan_param_id: 1,
            },
        ],
    )
    .unwrap();

    let mut decoder = RawWordDecoder::new();
    let records = decoder.decode_file(&raw_path).unwrap();
    assert_eq!(hits_of(&records).len(), 4);

    let table = read_index_table(&index_path).unwrap();
    let mut decoder = RawWordDecoder::new();
    let tagged = decoder
        .decode_tagged(&read_raw_words(&raw_path).unwrap(), &table)
        .unwrap();
    let params: Vec<Option<u32>> = tagged.iter().map(|t| t.scan_param_id).collect();
    assert_eq!(params, vec![Some(0), Some(0), Some(1), Some(1)]);
    assert_eq!(tagged[3].word_offset, 11);
}

#[test]
fn test_truncated_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.raw");
    std::fs::write(&path, [0u8; 7]).unwrap();

    let mut decoder = RawWordDecoder::new();
    assert!(decoder.decode_file(&path).is_err());
}

// ============================================================================
// Readout engine
// ============================================================================

fn collecting_errors() -> (ErrorCallback, Arc<Mutex<Vec<ReadoutError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let callback: ErrorCallback = Arc::new(move |e: ReadoutError| sink.lock().push(e));
    (callback, errors)
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() && start.elapsed() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_replay_through_engine_matches_offline_decode() {
    let words = triggered_stream();
    let config = DecoderConfig::default();
    let expected = RawWordDecoder::with_config(config).decode(&words).unwrap();

    let chunks = Arc::new(Mutex::new(Vec::<ReadoutChunk>::new()));
    let sink = Arc::clone(&chunks);
    let on_data: DataCallback = Box::new(move |chunk: ReadoutChunk| -> CallbackResult {
        sink.lock().push(chunk);
        Ok(())
    });

    let mut engine = ReadoutEngine::new(ReplayFifo::new(words.clone(), 7), None);
    let options = ReadoutOptions {
        interval: Duration::from_millis(2),
        online_decoding: Some(config),
        ..Default::default()
    };
    engine.start(Some(on_data), None, options).unwrap();

    let total = words.len();
    wait_for(Duration::from_secs(5), || {
        chunks.lock().iter().map(|c| c.data.len()).sum::<usize>() >= total
    });
    assert_eq!(engine.stop(Duration::from_secs(1)).unwrap(), StopOutcome::Graceful);

    let chunks = chunks.lock();
    let data: Vec<u32> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
    let records: Vec<Record> = chunks
        .iter()
        .flat_map(|c| c.records.clone().unwrap_or_default())
        .collect();
    assert_eq!(data, words);
    assert_eq!(records, expected);
    assert_eq!(engine.record_count(), chunks.len() as u64);
    for pair in chunks.windows(2) {
        assert!(pair[0].interval_stop <= pair[1].interval_start);
    }
}

#[test]
fn test_stop_with_zero_timeout_joins() {
    let fifo = MemoryFifo::new();
    let handle = fifo.handle();
    let (on_error, errors) = collecting_errors();
    let on_data: DataCallback = Box::new(|_chunk: ReadoutChunk| -> CallbackResult { Ok(()) });

    let mut engine = ReadoutEngine::new(fifo, None);
    engine
        .start(Some(on_data), Some(on_error), ReadoutOptions::default())
        .unwrap();
    handle.push(&REFERENCE_WORDS);

    let outcome = engine.stop(Duration::ZERO).unwrap();
    assert!(!engine.is_running());
    assert!(engine.fifo().is_some());

    let stop_timeouts = errors
        .lock()
        .iter()
        .filter(|e| e.kind() == Some(ErrorKind::StopTimeout))
        .count();
    match outcome {
        StopOutcome::Forced => assert_eq!(stop_timeouts, 1),
        StopOutcome::Graceful => assert_eq!(stop_timeouts, 0),
    }
}

#[test]
fn test_no_data_timeout_ends_acquisition() {
    let (on_error, errors) = collecting_errors();
    let mut engine = ReadoutEngine::new(MemoryFifo::new(), None);
    let options = ReadoutOptions {
        interval: Duration::from_millis(2),
        no_data_timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    engine.start(None, Some(on_error), options).unwrap();

    wait_for(Duration::from_secs(2), || !engine.is_acquiring());
    assert!(!engine.is_acquiring());
    // The session stays open until stopped
    assert!(engine.is_running());
    assert!(errors
        .lock()
        .iter()
        .any(|e| e.kind() == Some(ErrorKind::NoDataTimeout)));

    engine.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_engine_restarts_with_returned_fifo() {
    let fifo = MemoryFifo::new();
    let handle = fifo.handle();
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut engine = ReadoutEngine::new(fifo, None);

    for round in 0..2u32 {
        let sink = Arc::clone(&received);
        let on_data: DataCallback = Box::new(move |chunk: ReadoutChunk| -> CallbackResult {
            sink.lock().extend(chunk.data);
            Ok(())
        });
        let options = ReadoutOptions {
            interval: Duration::from_millis(2),
            ..Default::default()
        };
        engine.start(Some(on_data), None, options).unwrap();
        handle.push(&[round]);
        wait_for(Duration::from_secs(2), || received.lock().len() > round as usize);
        engine.stop(Duration::from_secs(1)).unwrap();
    }

    assert_eq!(*received.lock(), vec![0, 1]);
}

#[test]
fn test_callback_panic_does_not_stop_consumer() {
    let fifo = MemoryFifo::new();
    let handle = fifo.handle();
    let (on_error, errors) = collecting_errors();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let on_data: DataCallback = Box::new(move |chunk: ReadoutChunk| -> CallbackResult {
        if chunk.data.contains(&13) {
            panic!("unlucky word");
        }
        sink.lock().extend(chunk.data);
        Ok(())
    });

    let mut engine = ReadoutEngine::new(fifo, None);
    let options = ReadoutOptions {
        interval: Duration::from_millis(2),
        ..Default::default()
    };
    engine.start(Some(on_data), Some(on_error), options).unwrap();

    handle.push(&[13]);
    wait_for(Duration::from_secs(2), || !errors.lock().is_empty());
    handle.push(&[14]);
    wait_for(Duration::from_secs(2), || !seen.lock().is_empty());
    engine.stop(Duration::from_secs(1)).unwrap();

    assert_eq!(*seen.lock(), vec![14]);
    let errors = errors.lock();
    assert!(matches!(&errors[0], ReadoutError::CallbackPanic(msg) if msg.contains("unlucky")));
}

#[test]
fn test_record_count_visible_from_other_threads() {
    let fifo = MemoryFifo::new();
    let handle = fifo.handle();
    let mut engine = ReadoutEngine::new(fifo, None);
    let stats = engine.stats();
    let options = ReadoutOptions {
        interval: Duration::from_millis(2),
        ..Default::default()
    };
    engine.start(None, None, options).unwrap();
    handle.push(&[1, 2, 3]);

    let observer = thread::spawn(move || {
        let start = Instant::now();
        while stats.record_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(2));
        }
        stats.record_count()
    });
    assert!(observer.join().unwrap() >= 1);
    wait_for(Duration::from_secs(1), || engine.throughput().is_some());
    assert!(engine.throughput().is_some());

    engine.stop(Duration::from_secs(1)).unwrap();
    assert_eq!(engine.throughput(), None);
}
