//! Spaced repetition algorithm implementations.

pub mod fsrs;
pub mod goal;

use chrono::{DateTime, Utc};

use crate::types::{CardState, Rating};

/// Memory state of a card just before a review.
#[derive(Debug, Clone, PartialEq)]
pub struct CardSnapshot {
    pub state: CardState,
    pub stability: Option<f64>,
    pub difficulty: Option<f64>,
    pub due: DateTime<Utc>,
    pub last_review: Option<DateTime<Utc>>,
    pub reps: u32,
    pub lapses: u32,
    /// Learning step index, or goal table position.
    pub step: u32,
}

impl CardSnapshot {
    /// An unreviewed card anchored at `at`.
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            state: CardState::New,
            stability: None,
            difficulty: None,
            due: at,
            last_review: None,
            reps: 0,
            lapses: 0,
            step: 0,
        }
    }

    /// Days since the previous review, or zero for a fresh card.
    pub fn elapsed_days(&self, now: DateTime<Utc>) -> f64 {
        match self.last_review {
            Some(last) => (now.signed_duration_since(last).num_seconds() as f64 / 86400.0).max(0.0),
            None => 0.0,
        }
    }
}

/// Result of scheduling a card after review.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingResult {
    pub state: CardState,
    pub stability: f64,
    pub difficulty: f64,
    pub due: DateTime<Utc>,
    pub elapsed_days: f64,
    /// Whole days until the next review; zero for short-term steps.
    pub scheduled_days: f64,
    pub reps: u32,
    pub lapses: u32,
    pub step: u32,
}

/// Trait for spaced repetition algorithms.
pub trait SpacedRepetitionAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply `rating` given at `now`. `seed` drives interval fuzzing.
    fn schedule(
        &self,
        card: &CardSnapshot,
        rating: Rating,
        now: DateTime<Utc>,
        seed: u64,
    ) -> SchedulingResult;
}
