//! FSRS (Free Spaced Repetition Scheduler) algorithm.
//!
//! Modern algorithm based on memory research using DSR model:
//! - Difficulty (D): Card difficulty 1-10
//! - Stability (S): Days until retention drops to target
//! - Retrievability (R): Probability of recall
//!
//! Short-term learning and relearning steps are expressed in minutes; once a
//! card graduates its interval comes from stability and may be fuzzed.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use super::{CardSnapshot, SchedulingResult, SpacedRepetitionAlgorithm};
use crate::error::ScheduleError;
use crate::types::{CardState, Rating};

/// FSRS-4.5 default weights.
pub const DEFAULT_WEIGHTS: [f64; 17] = [
    0.4, 0.6, 2.4, 5.8, // w[0-3]: initial stability for Again, Hard, Good, Easy
    4.93, // w[4]: initial difficulty base
    0.94, // w[5]: initial difficulty modifier
    0.86, // w[6]: difficulty decay
    0.01, // w[7]: mean reversion weight
    1.49, // w[8]: stability exp base
    0.14, // w[9]: stability decay
    0.94, // w[10]: retrievability effect
    2.18, // w[11]: forget stability base
    0.05, // w[12]: difficulty on forget
    0.34, // w[13]: stability on forget
    1.26, // w[14]: retrievability on forget
    0.29, // w[15]: hard penalty
    2.61, // w[16]: easy bonus
];

/// (start, end, factor) bands for interval fuzzing.
const FUZZ_RANGES: [(f64, f64, f64); 3] = [
    (2.5, 7.0, 0.15),
    (7.0, 20.0, 0.1),
    (20.0, f64::INFINITY, 0.05),
];

/// FSRS algorithm with configurable parameters.
#[derive(Debug, Clone)]
pub struct Fsrs {
    pub request_retention: f64,
    pub maximum_interval: f64,
    pub w: [f64; 17],
    /// Minutes.
    pub learning_steps: Vec<f64>,
    /// Minutes.
    pub relearning_steps: Vec<f64>,
    pub enable_fuzzing: bool,
}

impl Default for Fsrs {
    fn default() -> Self {
        Self {
            request_retention: 0.9,
            maximum_interval: 36500.0,
            w: DEFAULT_WEIGHTS,
            learning_steps: vec![1.0, 10.0],
            relearning_steps: vec![10.0],
            enable_fuzzing: true,
        }
    }
}

/// Where a review lands before due dates are computed.
enum Next {
    Short { state: CardState, minutes: f64, step: u32 },
    Long,
}

impl SpacedRepetitionAlgorithm for Fsrs {
    fn name(&self) -> &'static str {
        "fsrs"
    }

    fn schedule(
        &self,
        card: &CardSnapshot,
        rating: Rating,
        now: DateTime<Utc>,
        seed: u64,
    ) -> SchedulingResult {
        let g = rating.to_value();
        let elapsed = card.elapsed_days(now);

        let (stability, difficulty) = match (card.stability, card.difficulty) {
            (Some(s), Some(d)) if card.state != CardState::New => {
                let r = self.retrievability(elapsed, s);
                let d_next = self.next_difficulty(d, g);
                let s_next = if rating == Rating::Again {
                    self.next_stability_forget(s, d, r)
                } else {
                    self.next_stability_recall(s, d, r, g)
                };
                (s_next, d_next)
            }
            _ => (self.initial_stability(g), self.initial_difficulty(g)),
        };

        let lapses = if card.state == CardState::Review && rating == Rating::Again {
            card.lapses + 1
        } else {
            card.lapses
        };

        match self.next_step(card, rating) {
            Next::Short {
                state,
                minutes,
                step,
            } => SchedulingResult {
                state,
                stability,
                difficulty,
                due: now + Duration::seconds((minutes * 60.0).round() as i64),
                elapsed_days: elapsed,
                scheduled_days: 0.0,
                reps: card.reps + 1,
                lapses,
                step,
            },
            Next::Long => {
                let mut days = self.interval_from_stability(stability);
                if self.enable_fuzzing {
                    days = self.apply_fuzz(days, elapsed, seed);
                }
                SchedulingResult {
                    state: CardState::Review,
                    stability,
                    difficulty,
                    due: now + Duration::days(days as i64),
                    elapsed_days: elapsed,
                    scheduled_days: days,
                    reps: card.reps + 1,
                    lapses,
                    step: 0,
                }
            }
        }
    }
}

impl Fsrs {
    /// Build from stored weights. Empty means defaults.
    pub fn with_weights(weights: &[f64]) -> Result<Self, ScheduleError> {
        let mut fsrs = Self::default();
        if weights.is_empty() {
            return Ok(fsrs);
        }
        if weights.len() < fsrs.w.len() {
            return Err(ScheduleError::InvalidParameters(format!(
                "expected {} weights, got {}",
                fsrs.w.len(),
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(ScheduleError::InvalidParameters(
                "weights must be finite".to_string(),
            ));
        }
        fsrs.w.copy_from_slice(&weights[..17]);
        Ok(fsrs)
    }

    /// Calculate initial stability for a new card based on first rating.
    /// S0(G) = w[G-1] where G is rating 1-4
    fn initial_stability(&self, rating: u8) -> f64 {
        let index = (rating.saturating_sub(1)) as usize;
        self.w[index.min(3)].max(0.1)
    }

    /// Calculate initial difficulty for a new card based on first rating.
    /// D0(G) = w[4] - w[5] * (G - 3)
    fn initial_difficulty(&self, rating: u8) -> f64 {
        let d0 = self.w[4] - self.w[5] * (rating as f64 - 3.0);
        d0.clamp(1.0, 10.0)
    }

    /// D' = w[7] * D0(G) + (1 - w[7]) * D, then D'' = D' - w[6] * (G - 3)
    fn next_difficulty(&self, current_d: f64, rating: u8) -> f64 {
        let d0 = self.initial_difficulty(rating);
        let d_new = self.w[7] * d0 + (1.0 - self.w[7]) * current_d;
        let d_decayed = d_new - self.w[6] * (rating as f64 - 3.0);
        d_decayed.clamp(1.0, 10.0)
    }

    /// R = (1 + t / (9 * S))^(-1)
    pub fn retrievability(&self, elapsed_days: f64, stability: f64) -> f64 {
        if stability <= 0.0 {
            return 0.0;
        }
        let factor = 1.0 + elapsed_days / (9.0 * stability);
        factor.powf(-1.0)
    }

    /// S' = S * (e^(w[8]) * (11 - D) * S^(-w[9]) * (e^(w[10]*(1-R)) - 1) + 1) * modifier
    fn next_stability_recall(
        &self,
        stability: f64,
        difficulty: f64,
        retrievability: f64,
        rating: u8,
    ) -> f64 {
        let exp_w8 = self.w[8].exp();
        let d_factor = (11.0 - difficulty).max(0.1);
        let s_decay = stability.powf(-self.w[9]);
        let r_factor = (self.w[10] * (1.0 - retrievability)).exp() - 1.0;

        let growth = exp_w8 * d_factor * s_decay * r_factor + 1.0;

        let modifier = match rating {
            2 => self.w[15],
            4 => self.w[16],
            _ => 1.0,
        };

        (stability * growth * modifier)
            .max(0.1)
            .min(self.maximum_interval)
    }

    /// S' = w[11] * D^(-w[12]) * ((S+1)^w[13] - 1) * e^(w[14]*(1-R))
    fn next_stability_forget(&self, stability: f64, difficulty: f64, retrievability: f64) -> f64 {
        let d_factor = difficulty.max(1.0).powf(-self.w[12]);
        let s_factor = (stability + 1.0).powf(self.w[13]) - 1.0;
        let r_factor = (self.w[14] * (1.0 - retrievability)).exp();

        let new_s = self.w[11] * d_factor * s_factor * r_factor;
        // Never exceed previous stability on lapse
        new_s.max(0.1).min(stability)
    }

    /// I = 9 * S * (1/R - 1), rounded to whole days.
    fn interval_from_stability(&self, stability: f64) -> f64 {
        let interval = if self.request_retention <= 0.0 || self.request_retention >= 1.0 {
            stability
        } else {
            9.0 * stability * (1.0 / self.request_retention - 1.0)
        };
        interval.round().max(1.0).min(self.maximum_interval.max(1.0))
    }

    fn next_step(&self, card: &CardSnapshot, rating: Rating) -> Next {
        match card.state {
            CardState::New | CardState::Learning => {
                let steps = &self.learning_steps;
                let Some(&first) = steps.first() else {
                    return Next::Long;
                };
                let current = if card.state == CardState::New { 0 } else { card.step };
                match rating {
                    Rating::Again => Next::Short {
                        state: CardState::Learning,
                        minutes: first,
                        step: 0,
                    },
                    Rating::Hard => Next::Short {
                        state: CardState::Learning,
                        minutes: hard_step(steps),
                        step: current,
                    },
                    Rating::Good => {
                        let next = current as usize + 1;
                        match steps.get(next) {
                            Some(&minutes) => Next::Short {
                                state: CardState::Learning,
                                minutes,
                                step: next as u32,
                            },
                            None => Next::Long,
                        }
                    }
                    Rating::Easy => Next::Long,
                }
            }
            CardState::Review => match (rating, self.relearning_steps.first()) {
                (Rating::Again, Some(&minutes)) => Next::Short {
                    state: CardState::Relearning,
                    minutes,
                    step: 0,
                },
                _ => Next::Long,
            },
            CardState::Relearning => match (rating, self.relearning_steps.first()) {
                (Rating::Again | Rating::Hard, Some(&minutes)) => Next::Short {
                    state: CardState::Relearning,
                    minutes,
                    step: 0,
                },
                _ => Next::Long,
            },
        }
    }

    /// Spread `interval` within a band that widens with its length.
    fn apply_fuzz(&self, interval: f64, elapsed_days: f64, seed: u64) -> f64 {
        if interval < 2.5 {
            return interval;
        }
        let max_allowed = self.maximum_interval.max(1.0);
        let delta = FUZZ_RANGES.iter().fold(1.0, |acc, &(start, end, factor)| {
            acc + factor * (interval.min(end) - start).max(0.0)
        });
        let interval = interval.min(max_allowed);
        let mut min_ivl = (interval - delta).round().max(2.0);
        let max_ivl = (interval + delta).round().min(max_allowed);
        if interval > elapsed_days {
            min_ivl = min_ivl.max(elapsed_days.floor() + 1.0);
        }
        let min_ivl = min_ivl.min(max_ivl);
        (unit_from_seed(seed) * (max_ivl - min_ivl + 1.0) + min_ivl).floor()
    }
}

fn hard_step(steps: &[f64]) -> f64 {
    match steps {
        [first, second, ..] => (first + second) / 2.0,
        [only] => only * 1.5,
        [] => 0.0,
    }
}

/// Deterministic fuzz seed for one review of one card.
pub fn fuzz_seed(record_id: &str, reps: u32, at: DateTime<Utc>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(record_id.as_bytes());
    hasher.update(reps.to_le_bytes());
    hasher.update(at.timestamp_millis().to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Map a seed onto [0, 1).
fn unit_from_seed(seed: u64) -> f64 {
    (seed >> 11) as f64 / (1u64 << 53) as f64
}
