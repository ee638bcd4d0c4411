//! Daily queue planning: windows, bucket classification and ordering.
//!
//! Storage of the frozen snapshot lives with the local store; this module
//! only decides which tunes go in and in what order.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Bucket, UserSchedulingOptions};

/// One practice day, in UTC, plus how far back "recently lapsed" reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub delinquency_days: u32,
}

impl PracticeWindow {
    /// The UTC day containing `now`.
    pub fn containing(now: DateTime<Utc>, delinquency_days: u32) -> Self {
        let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        Self::starting_at(start, delinquency_days)
    }

    /// A one-day window beginning at `start`.
    pub fn starting_at(start: DateTime<Utc>, delinquency_days: u32) -> Self {
        Self {
            start,
            end: start + Duration::days(1),
            delinquency_days,
        }
    }

    /// `YYYY-MM-DD` of the window start.
    pub fn queue_date(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Earliest due date still counted as recently lapsed.
    pub fn lapsed_floor(&self) -> DateTime<Utc> {
        self.start - Duration::days(i64::from(self.delinquency_days))
    }

    /// Bucket for a card, or `None` when it is not due in this window.
    pub fn classify(&self, practiced: bool, due: DateTime<Utc>) -> Option<Bucket> {
        if !practiced {
            return Some(Bucket::New);
        }
        if due >= self.end {
            None
        } else if due >= self.start {
            Some(Bucket::DueToday)
        } else if due >= self.lapsed_floor() {
            Some(Bucket::Lapsed)
        } else {
            Some(Bucket::OldLapsed)
        }
    }
}

/// A repertoire tune considered for today's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCandidate {
    pub tune_ref: String,
    /// Whether the tune has ever been reviewed.
    pub practiced: bool,
    /// Next due date; tunes without a card count as due at window start.
    pub due: Option<DateTime<Utc>>,
    /// Explicit add-to-review request.
    pub scheduled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub min_reviews_per_day: u32,
    /// Zero means unlimited.
    pub max_reviews_per_day: u32,
}

impl From<&UserSchedulingOptions> for QueueLimits {
    fn from(options: &UserSchedulingOptions) -> Self {
        Self {
            min_reviews_per_day: options.min_reviews_per_day,
            max_reviews_per_day: options.max_reviews_per_day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEntry {
    pub tune_ref: String,
    pub bucket: Bucket,
    pub order_index: i64,
}

/// Classify, order and cap candidates into today's queue.
///
/// Review buckets are ordered most-overdue first and capped at
/// `max_reviews_per_day`. Scheduled new tunes are always included; other
/// never-practiced tunes only top the queue up to `min_reviews_per_day`.
pub fn plan_queue(
    window: &PracticeWindow,
    candidates: &[QueueCandidate],
    limits: QueueLimits,
) -> Vec<PlannedEntry> {
    let mut reviews: Vec<(Bucket, DateTime<Utc>, &str)> = Vec::new();
    let mut scheduled_new: Vec<(DateTime<Utc>, &str)> = Vec::new();
    let mut unscheduled_new: Vec<(DateTime<Utc>, &str)> = Vec::new();

    for candidate in candidates {
        let due = candidate.due.unwrap_or(window.start);
        match window.classify(candidate.practiced, due) {
            Some(Bucket::New) => match candidate.scheduled {
                Some(at) => scheduled_new.push((at, &candidate.tune_ref)),
                None => unscheduled_new.push((due, &candidate.tune_ref)),
            },
            Some(bucket) => reviews.push((bucket, due, &candidate.tune_ref)),
            None => {}
        }
    }

    reviews.sort_by(|a, b| {
        a.0.rank()
            .cmp(&b.0.rank())
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(b.2))
    });
    if limits.max_reviews_per_day > 0 {
        reviews.truncate(limits.max_reviews_per_day as usize);
    }
    scheduled_new.sort();
    unscheduled_new.sort();

    let filled = reviews.len() + scheduled_new.len();
    let room = (limits.min_reviews_per_day as usize).saturating_sub(filled);
    unscheduled_new.truncate(room);

    let mut planned: Vec<(Bucket, &str)> = reviews
        .into_iter()
        .map(|(bucket, _, tune)| (bucket, tune))
        .chain(scheduled_new.into_iter().map(|(_, t)| (Bucket::New, t)))
        .chain(unscheduled_new.into_iter().map(|(_, t)| (Bucket::New, t)))
        .collect();
    // stable: keeps the within-bucket order built above
    planned.sort_by_key(|(bucket, _)| bucket.rank());

    planned
        .into_iter()
        .enumerate()
        .map(|(i, (bucket, tune))| PlannedEntry {
            tune_ref: tune.to_string(),
            bucket,
            order_index: i as i64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 14, 0, 0).unwrap()
    }

    fn window() -> PracticeWindow {
        PracticeWindow::containing(now(), 7)
    }

    fn reviewed(tune: &str, due: DateTime<Utc>) -> QueueCandidate {
        QueueCandidate {
            tune_ref: tune.into(),
            practiced: true,
            due: Some(due),
            scheduled: None,
        }
    }

    fn fresh(tune: &str, scheduled: Option<DateTime<Utc>>) -> QueueCandidate {
        QueueCandidate {
            tune_ref: tune.into(),
            practiced: false,
            due: None,
            scheduled,
        }
    }

    fn limits(min: u32, max: u32) -> QueueLimits {
        QueueLimits {
            min_reviews_per_day: min,
            max_reviews_per_day: max,
        }
    }

    fn summary(entries: &[PlannedEntry]) -> Vec<(&str, Bucket, i64)> {
        entries
            .iter()
            .map(|e| (e.tune_ref.as_str(), e.bucket, e.order_index))
            .collect()
    }

    #[test]
    fn window_covers_the_utc_day() {
        let w = window();
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2024, 7, 16, 0, 0, 0).unwrap());
        assert_eq!(w.queue_date(), "2024-07-15");
        assert!(w.contains(now()));
        assert!(!w.contains(w.end));
    }

    #[test]
    fn classification_by_due_date() {
        let w = window();
        assert_eq!(w.classify(true, now()), Some(Bucket::DueToday));
        assert_eq!(w.classify(true, w.start - Duration::days(3)), Some(Bucket::Lapsed));
        assert_eq!(w.classify(true, w.start - Duration::days(7)), Some(Bucket::Lapsed));
        assert_eq!(
            w.classify(true, w.start - Duration::days(8)),
            Some(Bucket::OldLapsed)
        );
        assert_eq!(w.classify(true, w.end), None);
        assert_eq!(w.classify(false, w.end + Duration::days(30)), Some(Bucket::New));
    }

    #[test]
    fn buckets_ordered_and_most_overdue_first() {
        let w = window();
        let candidates = vec![
            reviewed("old", w.start - Duration::days(30)),
            reviewed("lapsed-recent", w.start - Duration::days(1)),
            fresh("new", Some(now())),
            reviewed("today", now()),
            reviewed("lapsed-older", w.start - Duration::days(5)),
            reviewed("future", w.end + Duration::days(2)),
        ];
        let planned = plan_queue(&w, &candidates, limits(0, 0));
        assert_eq!(
            summary(&planned),
            vec![
                ("today", Bucket::DueToday, 0),
                ("lapsed-older", Bucket::Lapsed, 1),
                ("lapsed-recent", Bucket::Lapsed, 2),
                ("new", Bucket::New, 3),
                ("old", Bucket::OldLapsed, 4),
            ]
        );
    }

    #[test]
    fn reviews_are_capped_but_scheduled_new_tunes_are_not() {
        let w = window();
        let candidates = vec![
            reviewed("a", w.start + Duration::hours(1)),
            reviewed("b", w.start + Duration::hours(2)),
            reviewed("c", w.start + Duration::hours(3)),
            fresh("n1", Some(now())),
            fresh("n2", Some(now())),
        ];
        let planned = plan_queue(&w, &candidates, limits(0, 2));
        assert_eq!(
            summary(&planned),
            vec![
                ("a", Bucket::DueToday, 0),
                ("b", Bucket::DueToday, 1),
                ("n1", Bucket::New, 2),
                ("n2", Bucket::New, 3),
            ]
        );
    }

    #[test]
    fn unscheduled_new_tunes_top_up_to_minimum() {
        let w = window();
        let candidates = vec![
            reviewed("a", now()),
            fresh("x", None),
            fresh("y", None),
            fresh("z", None),
        ];
        let planned = plan_queue(&w, &candidates, limits(3, 20));
        assert_eq!(
            summary(&planned),
            vec![
                ("a", Bucket::DueToday, 0),
                ("x", Bucket::New, 1),
                ("y", Bucket::New, 2),
            ]
        );
    }

    #[test]
    fn planning_is_deterministic() {
        let w = window();
        let candidates = vec![
            reviewed("b", now()),
            reviewed("a", now()),
            fresh("n", Some(now())),
        ];
        let first = plan_queue(&w, &candidates, limits(5, 20));
        let mut reversed = candidates.clone();
        reversed.reverse();
        assert_eq!(first, plan_queue(&w, &reversed, limits(5, 20)));
    }
}
