//! Fixed interval ladders for practice goals other than plain recall.

use chrono::{DateTime, Duration, Utc};

use super::{CardSnapshot, SchedulingResult, SpacedRepetitionAlgorithm};
use crate::types::{CardState, Goal, Rating};

const INITIAL_LEARN: &[f64] = &[0.1, 0.5, 1.0, 2.0, 4.0];
const FLUENCY: &[f64] = &[1.0, 3.0, 7.0, 14.0, 21.0];
const SESSION_READY: &[f64] = &[0.5, 1.0, 2.0, 3.0, 5.0, 7.0];
const PERFORMANCE_POLISH: &[f64] = &[2.0, 4.0, 7.0, 14.0];

/// Caps the interval at one day.
pub const TECHNIQUE_DAILY_PRACTICE: &str = "daily_practice";
/// Shortens intervals to 70%.
pub const TECHNIQUE_MOTOR_SKILLS: &str = "motor_skills";

const DEFAULT_DIFFICULTY: f64 = 5.0;

/// Interval ladder walked by a step counter.
#[derive(Debug, Clone)]
pub struct GoalOverride {
    goal: Goal,
    technique: Option<String>,
    ladder: &'static [f64],
}

impl GoalOverride {
    /// `None` for [`Goal::Recall`], which uses the regular algorithm.
    pub fn for_goal(goal: Goal, technique: Option<&str>) -> Option<Self> {
        let ladder = match goal {
            Goal::Recall => return None,
            Goal::InitialLearn => INITIAL_LEARN,
            Goal::Fluency => FLUENCY,
            Goal::SessionReady => SESSION_READY,
            Goal::PerformancePolish => PERFORMANCE_POLISH,
        };
        Some(Self {
            goal,
            technique: technique.map(str::to_string),
            ladder,
        })
    }

    pub fn goal(&self) -> Goal {
        self.goal
    }

    fn next_step(&self, current: u32, rating: Rating) -> usize {
        let top = self.ladder.len().saturating_sub(1);
        let current = (current as usize).min(top);
        if rating.is_success() {
            (current + 1).min(top)
        } else {
            current.saturating_sub(1)
        }
    }

    fn adjust_for_technique(&self, days: f64) -> f64 {
        match self.technique.as_deref() {
            Some(TECHNIQUE_DAILY_PRACTICE) => days.min(1.0),
            Some(TECHNIQUE_MOTOR_SKILLS) => days * 0.7,
            _ => days,
        }
    }
}

impl SpacedRepetitionAlgorithm for GoalOverride {
    fn name(&self) -> &'static str {
        self.goal.as_str()
    }

    fn schedule(
        &self,
        card: &CardSnapshot,
        rating: Rating,
        now: DateTime<Utc>,
        _seed: u64,
    ) -> SchedulingResult {
        let step = self.next_step(card.step, rating);
        let days = self.adjust_for_technique(self.ladder[step]);

        let was_reviewing = matches!(card.state, CardState::Review | CardState::Relearning);
        let state = match (rating.is_success(), was_reviewing) {
            (true, _) => CardState::Review,
            (false, true) => CardState::Relearning,
            (false, false) => CardState::Learning,
        };
        let lapses = if card.state == CardState::Review && rating == Rating::Again {
            card.lapses + 1
        } else {
            card.lapses
        };

        SchedulingResult {
            state,
            stability: days,
            difficulty: card.difficulty.unwrap_or(DEFAULT_DIFFICULTY),
            due: now + Duration::seconds((days * 86400.0).round() as i64),
            elapsed_days: card.elapsed_days(now),
            scheduled_days: days,
            reps: card.reps + 1,
            lapses,
            step: step as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 8, 0, 0).unwrap()
    }

    fn at_step(step: u32) -> CardSnapshot {
        CardSnapshot {
            step,
            state: CardState::Review,
            ..CardSnapshot::empty(now())
        }
    }

    #[test]
    fn recall_has_no_override() {
        assert!(GoalOverride::for_goal(Goal::Recall, None).is_none());
    }

    #[test]
    fn success_climbs_the_ladder() {
        let fluency = GoalOverride::for_goal(Goal::Fluency, None).unwrap();
        let result = fluency.schedule(&at_step(1), Rating::Good, now(), 0);
        assert_eq!(result.step, 2);
        assert_eq!(result.scheduled_days, 7.0);
        assert_eq!(result.state, CardState::Review);
        assert_eq!(result.due, now() + Duration::days(7));
    }

    #[test]
    fn failure_steps_back_and_clamps_at_bottom() {
        let fluency = GoalOverride::for_goal(Goal::Fluency, None).unwrap();
        let back = fluency.schedule(&at_step(2), Rating::Hard, now(), 0);
        assert_eq!(back.step, 1);
        assert_eq!(back.state, CardState::Relearning);

        let bottom = fluency.schedule(&at_step(0), Rating::Again, now(), 0);
        assert_eq!(bottom.step, 0);
        assert_eq!(bottom.scheduled_days, 1.0);
        assert_eq!(bottom.lapses, 1);
    }

    #[test]
    fn ladder_is_clamped_at_top() {
        let polish = GoalOverride::for_goal(Goal::PerformancePolish, None).unwrap();
        let result = polish.schedule(&at_step(3), Rating::Easy, now(), 0);
        assert_eq!(result.step, 3);
        assert_eq!(result.scheduled_days, 14.0);
    }

    #[test]
    fn new_card_failure_stays_in_learning() {
        let learn = GoalOverride::for_goal(Goal::InitialLearn, None).unwrap();
        let result = learn.schedule(&CardSnapshot::empty(now()), Rating::Again, now(), 0);
        assert_eq!(result.state, CardState::Learning);
        assert_eq!(result.lapses, 0);
    }

    #[test]
    fn technique_adjusts_interval() {
        let daily = GoalOverride::for_goal(Goal::Fluency, Some(TECHNIQUE_DAILY_PRACTICE)).unwrap();
        assert_eq!(daily.schedule(&at_step(3), Rating::Good, now(), 0).scheduled_days, 1.0);

        let motor = GoalOverride::for_goal(Goal::Fluency, Some(TECHNIQUE_MOTOR_SKILLS)).unwrap();
        let result = motor.schedule(&at_step(1), Rating::Good, now(), 0);
        assert!((result.scheduled_days - 4.9).abs() < 1e-9);
    }
}
