//! Fragment assembly state machines.
//!
//! Hits and clock-domain timestamps both arrive as three consecutive words.
//! Each assembler tracks which fragment it expects next; any other order is a
//! framing error that resets the assembler to [`FragmentState::Idle`].

use crate::parser;
use crate::types::{Fragment, HitRecord, RawWord, TimestampEvent, NUM_DOMAINS};

/// Progress of a three-word fragment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentState {
    #[default]
    Idle,
    GotLow,
    GotMid,
}

impl FragmentState {
    /// The fragment this state is waiting for.
    #[inline]
    pub fn expected(&self) -> Fragment {
        match self {
            FragmentState::Idle => Fragment::Low,
            FragmentState::GotLow => Fragment::Mid,
            FragmentState::GotMid => Fragment::High,
        }
    }
}

/// Outcome of feeding one word into an assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// Fragment accepted, more words needed.
    Pending,
    /// Final fragment accepted, value assembled.
    Complete(T),
    /// Fragment arrived out of order; the assembler was reset.
    Framing { expected: Fragment },
}

/// Assembles hit records from hit words 0, 1 and 2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitAssembler {
    state: FragmentState,
    column: u8,
    row: u8,
    leading_edge: u8,
    trailing_edge: u8,
    flag: u8,
    timestamp: u64,
}

impl HitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FragmentState {
        self.state
    }

    /// Drops any partially assembled hit.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds a hit word tagged with its position in the triple.
    ///
    /// An out-of-order word is consumed and the assembler resets, so decoding
    /// resumes at the following word. A word 0 arriving mid-hit is consumed
    /// too: it does not start a new hit, and the words 1 and 2 behind it are
    /// then framing errors as well.
    pub fn push(&mut self, fragment: Fragment, word: RawWord) -> Step<HitRecord> {
        let expected = self.state.expected();
        if fragment != expected {
            self.reset();
            return Step::Framing { expected };
        }
        match fragment {
            Fragment::Low => {
                self.column = parser::hit_get_column(word);
                self.row = parser::hit_get_row(word);
                self.leading_edge = parser::hit_get_leading_edge(word);
                self.trailing_edge = parser::hit_get_trailing_edge(word);
                self.flag = parser::hit_get_noise(word);
                self.state = FragmentState::GotLow;
                Step::Pending
            }
            Fragment::Mid => {
                self.timestamp = parser::hit_get_timestamp_low(word);
                self.state = FragmentState::GotMid;
                Step::Pending
            }
            Fragment::High => {
                self.timestamp |= parser::hit_get_timestamp_high(word);
                let hit = HitRecord::new(
                    self.column,
                    self.row,
                    self.leading_edge,
                    self.trailing_edge,
                    self.flag,
                    self.timestamp,
                );
                self.reset();
                Step::Complete(hit)
            }
        }
    }
}

/// Running counter of one clock domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampCounter {
    state: FragmentState,
    /// Value under assembly
    accumulator: u64,
    /// Value completed by the most recent high fragment
    snapshot: u64,
    /// Snapshot preceding `snapshot`
    previous: u64,
    /// Number of completed triples
    count: u64,
}

impl TimestampCounter {
    pub fn state(&self) -> FragmentState {
        self.state
    }

    /// Latest completed counter value, used to widen triggers.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Completed value before the latest one.
    pub fn previous(&self) -> u64 {
        self.previous
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Drops a partially assembled value, keeping the last snapshot.
    pub fn reset_fragments(&mut self) {
        self.state = FragmentState::Idle;
        self.accumulator = 0;
    }
}

/// Assembles timestamp triples for all clock domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampAssembler {
    counters: [TimestampCounter; NUM_DOMAINS],
}

impl TimestampAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, domain: u8) -> &TimestampCounter {
        &self.counters[domain as usize % NUM_DOMAINS]
    }

    /// Resets partial fragments in every domain.
    pub fn reset_fragments(&mut self) {
        for counter in self.counters.iter_mut() {
            counter.reset_fragments();
        }
    }

    /// Forgets all counter history.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds a timestamp word of `domain`.
    pub fn push(&mut self, domain: u8, fragment: Fragment, word: RawWord) -> Step<TimestampEvent> {
        let index = domain as usize % NUM_DOMAINS;
        let layout = parser::DOMAIN_LAYOUTS[index];
        let counter = &mut self.counters[index];

        let expected = counter.state.expected();
        if fragment != expected {
            counter.reset_fragments();
            return Step::Framing { expected };
        }

        let placed = layout.place(fragment, parser::ts_get_payload(word));
        match fragment {
            Fragment::Low => {
                counter.accumulator = placed;
                counter.state = FragmentState::GotLow;
                Step::Pending
            }
            Fragment::Mid => {
                counter.accumulator |= placed;
                counter.state = FragmentState::GotMid;
                Step::Pending
            }
            Fragment::High => {
                let value = counter.accumulator | placed;
                counter.previous = counter.snapshot;
                counter.snapshot = value;
                counter.count += 1;
                counter.reset_fragments();
                Step::Complete(TimestampEvent {
                    domain: index as u8,
                    count: counter.count,
                    value,
                    delta: value.wrapping_sub(counter.previous),
                })
            }
        }
    }
}
