//! Synchronization of two independently clocked monotonic streams.
//!
//! The correlator pairs trigger records with precise timestamp records by a
//! two-pointer merge over the modular residual between their timestamps.

use crate::config::ConfigError;
use crate::parser::mask;
use crate::types::{ErrorKind, TimestampEvent, TriggerRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while correlating streams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No valid head alignment within the first {searched} candidates (first residual {residual})")]
    Desync { searched: usize, residual: i64 },

    #[error("Invalid correlator configuration: {0}")]
    InvalidConfig(String),
}

impl CorrelationError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CorrelationError::Desync { .. } => Some(ErrorKind::DesyncError),
            CorrelationError::InvalidConfig(_) => None,
        }
    }
}

/// A record carrying a timestamp on its own clock.
pub trait Stamped {
    fn stamp(&self) -> u64;
}

impl Stamped for TriggerRecord {
    #[inline]
    fn stamp(&self) -> u64 {
        self.timestamp
    }
}

impl Stamped for TimestampEvent {
    #[inline]
    fn stamp(&self) -> u64 {
        self.value
    }
}

impl Stamped for u64 {
    #[inline]
    fn stamp(&self) -> u64 {
        *self
    }
}

/// Correlator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Both counters are monotonic modulo `2^wrap_bits`
    pub wrap_bits: u32,
    /// Nominal phase offset `A - B`
    pub offset: i64,
    /// Largest accepted absolute residual
    pub window: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            wrap_bits: 64,
            offset: 0,
            window: 16,
        }
    }
}

impl CorrelatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=64).contains(&self.wrap_bits) {
            return Err(ConfigError::Invalid(format!(
                "wrap_bits must be within 2..=64, got {}",
                self.wrap_bits
            )));
        }
        if self.window >= 1u64 << (self.wrap_bits - 1).min(63) {
            return Err(ConfigError::Invalid(format!(
                "window {} must be below half the wraparound range",
                self.window
            )));
        }
        Ok(())
    }
}

/// Stream that carried extra records before genuine synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraRecord {
    /// The first `n` records of stream A were skipped.
    A(usize),
    /// The first `n` records of stream B were skipped.
    B(usize),
}

/// A trigger paired with its precise timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorrelatedTrigger {
    pub trigger_number: u32,
    /// Full timestamp taken from the precise stream
    pub timestamp: u64,
    pub trigger_index: usize,
    pub timestamp_index: usize,
    /// Signed modular residual of the pair
    pub residual: i64,
}

/// Index pairs produced by a correlation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    /// Accepted `(a_index, b_index, residual)` pairs, in stream order
    pub pairs: Vec<(usize, usize, i64)>,
    /// Leading records skipped to find the head alignment
    pub extra: Option<ExtraRecord>,
    /// Records of A left without a partner
    pub unmatched_a: usize,
    /// Records of B left without a partner
    pub unmatched_b: usize,
}

/// Candidate head alignments tried in order: `(skip_a, skip_b)`.
const HEAD_CANDIDATES: [(usize, usize); 5] = [(0, 0), (1, 0), (0, 1), (2, 0), (0, 2)];

/// Two-stream correlator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCorrelator {
    config: CorrelatorConfig,
}

impl StreamCorrelator {
    pub fn new(config: CorrelatorConfig) -> Result<Self, CorrelationError> {
        config
            .validate()
            .map_err(|e| CorrelationError::InvalidConfig(e.to_string()))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Signed residual `(a - b - offset) mod 2^wrap_bits`.
    #[inline]
    pub fn residual(&self, a: u64, b: u64) -> i64 {
        let bits = self.config.wrap_bits;
        let raw = a.wrapping_sub(b).wrapping_sub(self.config.offset as u64) & mask(bits);
        // Sign-extend from bit `bits - 1`
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    }

    #[inline]
    fn accepts(&self, residual: i64) -> bool {
        residual.unsigned_abs() <= self.config.window
    }

    /// Correlates two ordered streams into index pairs.
    pub fn correlate<A: Stamped, B: Stamped>(
        &self,
        a: &[A],
        b: &[B],
    ) -> Result<Correlation, CorrelationError> {
        if a.is_empty() || b.is_empty() {
            return Ok(Correlation {
                unmatched_a: a.len(),
                unmatched_b: b.len(),
                ..Default::default()
            });
        }

        let first_residual = self.residual(a[0].stamp(), b[0].stamp());
        let mut head = None;
        for &(skip_a, skip_b) in HEAD_CANDIDATES.iter() {
            if skip_a >= a.len() || skip_b >= b.len() {
                continue;
            }
            if self.accepts(self.residual(a[skip_a].stamp(), b[skip_b].stamp())) {
                head = Some((skip_a, skip_b));
                break;
            }
        }

        let (skip_a, skip_b) = match head {
            Some(head) => head,
            None => {
                warn!(first_residual, "Streams desynchronized at head");
                return Err(CorrelationError::Desync {
                    searched: HEAD_CANDIDATES.len(),
                    residual: first_residual,
                });
            }
        };

        let extra = match (skip_a, skip_b) {
            (0, 0) => None,
            (n, 0) => Some(ExtraRecord::A(n)),
            (_, n) => Some(ExtraRecord::B(n)),
        };
        if let Some(extra) = extra {
            debug!(?extra, "Skipped leading records to synchronize");
        }

        let mut result = Correlation {
            extra,
            unmatched_a: skip_a,
            unmatched_b: skip_b,
            ..Default::default()
        };
        let (mut i, mut j) = (skip_a, skip_b);
        while i < a.len() && j < b.len() {
            let residual = self.residual(a[i].stamp(), b[j].stamp());
            if self.accepts(residual) {
                result.pairs.push((i, j, residual));
                i += 1;
                j += 1;
            } else if residual > 0 {
                // B is behind A
                result.unmatched_b += 1;
                j += 1;
            } else {
                result.unmatched_a += 1;
                i += 1;
            }
        }
        result.unmatched_a += a.len() - i;
        result.unmatched_b += b.len() - j;

        Ok(result)
    }

    /// Pairs triggers with precise timestamps of the trigger clock.
    pub fn correlate_triggers(
        &self,
        triggers: &[TriggerRecord],
        timestamps: &[TimestampEvent],
    ) -> Result<(Vec<CorrelatedTrigger>, Correlation), CorrelationError> {
        let correlation = self.correlate(triggers, timestamps)?;
        let paired = correlation
            .pairs
            .iter()
            .map(|&(i, j, residual)| CorrelatedTrigger {
                trigger_number: triggers[i].trigger_number,
                timestamp: timestamps[j].value,
                trigger_index: i,
                timestamp_index: j,
                residual,
            })
            .collect();
        Ok((paired, correlation))
    }
}
