//! Review scheduling entry points.
//!
//! [`Scheduler`] turns a rated review into the next state of a practice
//! record. Recall goals use FSRS; other goals walk a fixed interval ladder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algorithm::fsrs::{fuzz_seed, Fsrs};
use crate::algorithm::goal::GoalOverride;
use crate::algorithm::{CardSnapshot, SchedulingResult, SpacedRepetitionAlgorithm};
use crate::error::ScheduleError;
use crate::types::{Algorithm, CardState, Goal, PracticeRecord, PrefsSpacedRepetition, Rating};

/// One submitted review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewInput {
    /// Practice record id; seeds interval fuzzing.
    pub record_id: String,
    pub practiced: DateTime<Utc>,
    /// 0-5 quality; only 1-4 are valid.
    pub quality: u8,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default)]
    pub technique: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub next_due: DateTime<Utc>,
    pub state: CardState,
    pub stability: f64,
    pub difficulty: f64,
    pub elapsed_days: f64,
    pub scheduled_days: f64,
    pub reps: u32,
    pub lapses: u32,
    pub last_review: DateTime<Utc>,
    /// Whole days between review and next due, at least 1.
    pub interval: i64,
    pub step: u32,
}

impl ScheduleResult {
    fn from_algorithm(result: SchedulingResult, practiced: DateTime<Utc>) -> Self {
        let days = result.due.signed_duration_since(practiced).num_seconds() as f64 / 86400.0;
        Self {
            next_due: result.due,
            state: result.state,
            stability: result.stability,
            difficulty: result.difficulty,
            elapsed_days: result.elapsed_days,
            scheduled_days: result.scheduled_days,
            reps: result.reps,
            lapses: result.lapses,
            last_review: practiced,
            interval: (days.round() as i64).max(1),
            step: result.step,
        }
    }

    /// Write this outcome into `record`.
    pub fn apply_to(&self, record: &mut PracticeRecord, input: &ReviewInput) {
        record.practiced = Some(self.last_review);
        record.quality = Some(input.quality);
        record.difficulty = Some(self.difficulty);
        record.stability = Some(self.stability);
        record.interval = self.interval;
        record.elapsed_days = self.elapsed_days;
        record.repetitions = self.reps;
        record.lapses = self.lapses;
        record.state = self.state;
        record.due = self.next_due;
        record.goal = input.goal;
        record.technique = input.technique.clone();
        record.step = self.step;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    fsrs: Fsrs,
}

impl Scheduler {
    /// Build from stored preferences; `None` uses the defaults.
    pub fn new(prefs: Option<&PrefsSpacedRepetition>) -> Result<Self, ScheduleError> {
        let Some(prefs) = prefs else {
            return Ok(Self::default());
        };

        match Algorithm::parse(&prefs.alg_type)? {
            Algorithm::Fsrs => {}
        }

        let mut fsrs = Fsrs::with_weights(&prefs.weights)?;

        if !(prefs.request_retention > 0.0 && prefs.request_retention < 1.0) {
            return Err(ScheduleError::InvalidParameters(format!(
                "request_retention must be in (0, 1), got {}",
                prefs.request_retention
            )));
        }
        if prefs.maximum_interval == 0 {
            return Err(ScheduleError::InvalidParameters(
                "maximum_interval must be positive".to_string(),
            ));
        }
        for steps in [&prefs.learning_steps, &prefs.relearning_steps] {
            if steps.iter().any(|m| !m.is_finite() || *m <= 0.0) {
                return Err(ScheduleError::InvalidParameters(
                    "learning steps must be positive minutes".to_string(),
                ));
            }
        }

        fsrs.request_retention = prefs.request_retention;
        fsrs.maximum_interval = prefs.maximum_interval as f64;
        fsrs.learning_steps = prefs.learning_steps.clone();
        fsrs.relearning_steps = prefs.relearning_steps.clone();
        fsrs.enable_fuzzing = prefs.enable_fuzzing;
        Ok(Self { fsrs })
    }

    /// Narrow the maximum interval to `round(3 * tune_count / max_reviews_per_day)`.
    ///
    /// Larger repertoires spread out further. A zero limit leaves the
    /// configured maximum untouched.
    pub fn with_dynamic_max_interval(mut self, tune_count: usize, max_reviews_per_day: u32) -> Self {
        if max_reviews_per_day == 0 || tune_count == 0 {
            return self;
        }
        let dynamic = (3.0 * tune_count as f64 / max_reviews_per_day as f64).round();
        self.fsrs.maximum_interval = dynamic.clamp(1.0, self.fsrs.maximum_interval);
        self
    }

    pub fn maximum_interval(&self) -> f64 {
        self.fsrs.maximum_interval
    }

    pub fn process_first_review(&self, input: &ReviewInput) -> Result<ScheduleResult, ScheduleError> {
        let card = CardSnapshot::empty(input.practiced);
        self.run(input, &card)
    }

    /// Schedule a repeat review of `latest`.
    ///
    /// Ladder positions and learning steps share `step`, so a goal change
    /// starts the new schedule from step zero.
    pub fn process_review(
        &self,
        input: &ReviewInput,
        latest: &PracticeRecord,
    ) -> Result<ScheduleResult, ScheduleError> {
        let step = if latest.goal == input.goal { latest.step } else { 0 };
        let card = CardSnapshot {
            state: latest.state,
            stability: latest.stability,
            difficulty: latest.difficulty,
            due: latest.due,
            last_review: latest.practiced,
            reps: latest.repetitions,
            lapses: latest.lapses,
            step,
        };
        self.run(input, &card)
    }

    fn run(&self, input: &ReviewInput, card: &CardSnapshot) -> Result<ScheduleResult, ScheduleError> {
        let rating = Rating::from_quality(input.quality)?;
        let seed = fuzz_seed(&input.record_id, card.reps, input.practiced);

        let result = match GoalOverride::for_goal(input.goal, input.technique.as_deref()) {
            Some(ladder) => ladder.schedule(card, rating, input.practiced, seed),
            None => self.fsrs.schedule(card, rating, input.practiced, seed),
        };
        Ok(ScheduleResult::from_algorithm(result, input.practiced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 12, 19, 30, 0).unwrap()
    }

    fn input(quality: u8, practiced: DateTime<Utc>) -> ReviewInput {
        ReviewInput {
            record_id: "rec-1".into(),
            practiced,
            quality,
            goal: Goal::Recall,
            technique: None,
        }
    }

    fn prefs() -> PrefsSpacedRepetition {
        PrefsSpacedRepetition::defaults_for("u1", t())
    }

    #[test]
    fn first_review_good_is_learning_or_review_with_positive_interval() {
        let scheduler = Scheduler::new(None).unwrap();
        let result = scheduler.process_first_review(&input(3, t())).unwrap();
        assert!(matches!(result.state, CardState::Learning | CardState::Review));
        assert!(result.interval >= 1);
        assert_eq!(result.reps, 1);
        assert_eq!(result.last_review, t());
    }

    #[test]
    fn first_then_good_review_reaches_review_state() {
        let scheduler = Scheduler::new(Some(&prefs())).unwrap();
        let first = scheduler.process_first_review(&input(3, t())).unwrap();

        let mut record = PracticeRecord::new_card("rec-1".into(), "r1", "t1", t());
        first.apply_to(&mut record, &input(3, t()));

        let later = first.next_due;
        let second = scheduler.process_review(&input(3, later), &record).unwrap();
        assert_eq!(second.state, CardState::Review);
        assert!(second.next_due > later);
        assert_eq!(second.reps, 2);
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let scheduler = Scheduler::default();
        assert_eq!(
            scheduler.process_first_review(&input(0, t())),
            Err(ScheduleError::InvalidRating { quality: 0 })
        );
        assert_eq!(
            scheduler.process_first_review(&input(5, t())),
            Err(ScheduleError::InvalidRating { quality: 5 })
        );
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut p = prefs();
        p.alg_type = "SM2".into();
        assert!(matches!(
            Scheduler::new(Some(&p)),
            Err(ScheduleError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn short_weight_vector_is_rejected() {
        let mut p = prefs();
        p.weights = vec![0.5; 4];
        assert!(matches!(
            Scheduler::new(Some(&p)),
            Err(ScheduleError::InvalidParameters(_))
        ));
    }

    #[test]
    fn dynamic_max_interval_scales_with_repertoire() {
        let scheduler = Scheduler::default().with_dynamic_max_interval(200, 20);
        assert_eq!(scheduler.maximum_interval(), 30.0);

        let unlimited = Scheduler::default().with_dynamic_max_interval(200, 0);
        assert_eq!(unlimited.maximum_interval(), 36500.0);

        let tiny = Scheduler::default().with_dynamic_max_interval(1, 20);
        assert_eq!(tiny.maximum_interval(), 1.0);
    }

    #[test]
    fn review_interval_is_capped_by_dynamic_max() {
        let scheduler = Scheduler::default().with_dynamic_max_interval(100, 20);
        let mut record = PracticeRecord::new_card("rec-1".into(), "r1", "t1", t());
        record.state = CardState::Review;
        record.stability = Some(400.0);
        record.difficulty = Some(4.0);
        record.practiced = Some(t() - Duration::days(40));
        record.repetitions = 8;

        let result = scheduler.process_review(&input(4, t()), &record).unwrap();
        assert!(result.interval <= 15);
    }

    #[test]
    fn goal_override_bypasses_fsrs() {
        let scheduler = Scheduler::default();
        let mut review = input(3, t());
        review.goal = Goal::SessionReady;
        let result = scheduler.process_first_review(&review).unwrap();
        assert_eq!(result.state, CardState::Review);
        assert_eq!(result.scheduled_days, 1.0);
        assert_eq!(result.next_due, t() + Duration::days(1));
        assert_eq!(result.interval, 1);
    }

    #[test]
    fn same_review_is_reproducible() {
        let scheduler = Scheduler::default();
        let mut record = PracticeRecord::new_card("rec-1".into(), "r1", "t1", t());
        record.state = CardState::Review;
        record.stability = Some(20.0);
        record.difficulty = Some(5.0);
        record.practiced = Some(t() - Duration::days(20));
        record.repetitions = 4;

        let a = scheduler.process_review(&input(3, t()), &record).unwrap();
        let b = scheduler.process_review(&input(3, t()), &record).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn switching_goal_restarts_the_step_counter() {
        let scheduler = Scheduler::default();
        let mut record = PracticeRecord::new_card("rec-1".into(), "r1", "t1", t());
        record.state = CardState::Learning;
        record.practiced = Some(t() - Duration::minutes(30));
        record.stability = Some(1.0);
        record.difficulty = Some(5.0);
        record.repetitions = 5;
        record.goal = Goal::Fluency;
        record.step = 4;

        let result = scheduler.process_review(&input(3, t()), &record).unwrap();
        assert_eq!(result.state, CardState::Learning);
        assert_eq!(result.step, 1);
        assert_eq!(result.next_due, t() + Duration::minutes(10));

        let mut same_goal = input(3, t());
        same_goal.goal = Goal::Fluency;
        let ladder = scheduler.process_review(&same_goal, &record).unwrap();
        assert_eq!(ladder.step, 4);
    }
}
