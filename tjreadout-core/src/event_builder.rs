//! Assignment of hits to correlated triggers.
//!
//! Hits and triggers are both time ordered, so a two-pointer merge assigns
//! every hit to the nearest trigger inside a fixed tick window.

use crate::config::ConfigError;
use crate::correlator::CorrelatedTrigger;
use crate::types::{HitRecord, FLAG_DUPLICATE};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Event builder settings.
///
/// A hit belongs to a trigger when `hit.timestamp - trigger.timestamp` lies
/// within `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub lower: i64,
    pub upper: i64,
    /// Mark non-seed hits of coincident clusters before building
    pub mark_seeds: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            lower: 0,
            upper: 255,
            mark_seeds: true,
        }
    }
}

impl BuilderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower > self.upper {
            return Err(ConfigError::Invalid(format!(
                "builder window lower bound {} exceeds upper bound {}",
                self.lower, self.upper
            )));
        }
        Ok(())
    }
}

/// A hit with its event identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssignedHit {
    pub hit: HitRecord,
    pub trigger_number: u32,
    /// Index of the trigger in the correlated stream
    pub event_index: usize,
    /// `hit.timestamp - trigger.timestamp`
    pub delta: i64,
    /// Whether this hit is the seed of its cluster
    pub is_seed: bool,
}

/// Output of an event building pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltEvents {
    pub hits: Vec<AssignedHit>,
    /// Hits outside every trigger window
    pub dropped: usize,
    /// Number of distinct triggers with at least one hit
    pub events: usize,
}

/// Marks non-seed hits within runs of hits sharing one raw timestamp.
///
/// The seed of a run is the hit with the smallest leading edge offset; the
/// earliest hit wins ties. Returns the number of hits marked as duplicates.
pub fn mark_cluster_seeds(hits: &mut [HitRecord]) -> usize {
    let mut marked = 0;
    let mut start = 0;
    while start < hits.len() {
        let timestamp = hits[start].timestamp;
        let mut end = start + 1;
        while end < hits.len() && hits[end].timestamp == timestamp {
            end += 1;
        }

        let cluster = &mut hits[start..end];
        let mut seed = 0;
        for (index, hit) in cluster.iter().enumerate() {
            if hit.leading_edge < cluster[seed].leading_edge {
                seed = index;
            }
        }
        for (index, hit) in cluster.iter_mut().enumerate() {
            if index == seed {
                hit.flag &= !FLAG_DUPLICATE;
            } else {
                hit.flag |= FLAG_DUPLICATE;
                marked += 1;
            }
        }

        start = end;
    }
    marked
}

/// Two-pointer event builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventBuilder {
    config: BuilderConfig,
}

impl EventBuilder {
    pub fn new(config: BuilderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    #[inline]
    fn delta(hit: &HitRecord, trigger: &CorrelatedTrigger) -> i64 {
        hit.timestamp.wrapping_sub(trigger.timestamp) as i64
    }

    /// Assigns hits to triggers. Both inputs must be time ordered.
    pub fn build(&self, triggers: &[CorrelatedTrigger], hits: &[HitRecord]) -> BuiltEvents {
        let BuilderConfig { lower, upper, .. } = self.config;
        let mut out = BuiltEvents::default();
        let mut last_event = None;
        let mut t = 0;

        for hit in hits {
            // Drop triggers too old for this and every later hit
            while t < triggers.len() && Self::delta(hit, &triggers[t]) > upper {
                t += 1;
            }
            if t == triggers.len() || Self::delta(hit, &triggers[t]) < lower {
                out.dropped += 1;
                continue;
            }

            // Nearest trigger within the window; ties keep the earlier one
            let mut best = t;
            let mut best_distance = Self::delta(hit, &triggers[t]).unsigned_abs();
            let mut k = t + 1;
            while k < triggers.len() {
                let delta = Self::delta(hit, &triggers[k]);
                if delta < lower {
                    break;
                }
                if delta.unsigned_abs() < best_distance {
                    best = k;
                    best_distance = delta.unsigned_abs();
                }
                k += 1;
            }

            if last_event != Some(best) {
                out.events += 1;
                last_event = Some(best);
            }
            out.hits.push(AssignedHit {
                hit: *hit,
                trigger_number: triggers[best].trigger_number,
                event_index: best,
                delta: Self::delta(hit, &triggers[best]),
                is_seed: !hit.is_duplicate(),
            });
        }

        debug!(
            assigned = out.hits.len(),
            dropped = out.dropped,
            events = out.events,
            "Built events"
        );
        out
    }

    /// Marks cluster seeds on a copy of `hits` if configured, then builds.
    pub fn build_marked(
        &self,
        triggers: &[CorrelatedTrigger],
        hits: &[HitRecord],
    ) -> BuiltEvents {
        if self.config.mark_seeds {
            let mut marked = hits.to_vec();
            mark_cluster_seeds(&mut marked);
            self.build(triggers, &marked)
        } else {
            self.build(triggers, hits)
        }
    }
}
