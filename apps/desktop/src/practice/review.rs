//! Review submission.

use chrono::{DateTime, Utc};
use repertoire_core::sync::derived_id;
use repertoire_core::{
    Goal, PracticeRecord, Rating, RepertoireTune, ReviewInput, Scheduler, UserSchedulingOptions,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{DbError, PracticeRepository, QueueRepository, SqliteRepository};

type Result<T> = std::result::Result<T, DbError>;

/// One graded practice of a tune.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReview {
    pub user_ref: String,
    pub repertoire_ref: String,
    pub tune_ref: String,
    /// 0-5 quality; only 1-4 are accepted.
    pub quality: u8,
    pub practiced: DateTime<Utc>,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default)]
    pub technique: Option<String>,
}

/// Id of the single practice record of a repertoire tune.
pub fn practice_record_id(repertoire_ref: &str, tune_ref: &str) -> String {
    derived_id(&["practice_record", repertoire_ref, tune_ref])
}

/// Schedule the next review of a tune and record the practice.
///
/// The practice record is updated in place; today's queue row for the tune
/// is stamped completed and any explicit scheduling request is cleared.
pub fn submit_review(repo: &SqliteRepository, review: &SubmitReview) -> Result<PracticeRecord> {
    Rating::from_quality(review.quality)?;

    let membership = repo
        .get_repertoire_tune(&review.repertoire_ref, &review.tune_ref)?
        .ok_or_else(|| {
            DbError::Validation(format!(
                "tune {} is not in repertoire {}",
                review.tune_ref, review.repertoire_ref
            ))
        })?;

    let now = repo.now();
    let prefs = repo.get_prefs(&review.user_ref)?;
    let options = repo
        .get_scheduling_options(&review.user_ref)?
        .unwrap_or_else(|| UserSchedulingOptions::defaults_for(&review.user_ref, now));
    let tune_count = repo.count_repertoire_tunes(&review.repertoire_ref)?;
    let scheduler = Scheduler::new(prefs.as_ref())?
        .with_dynamic_max_interval(tune_count, options.max_reviews_per_day);

    let existing = repo.get_practice_record(&review.repertoire_ref, &review.tune_ref)?;
    let record_id = existing
        .as_ref()
        .map(|r| r.id.clone())
        .unwrap_or_else(|| practice_record_id(&review.repertoire_ref, &review.tune_ref));
    let input = ReviewInput {
        record_id: record_id.clone(),
        practiced: review.practiced,
        quality: review.quality,
        goal: review.goal,
        technique: review.technique.clone(),
    };

    let (mut record, result) = match existing {
        Some(record) if record.is_practiced() => {
            let result = scheduler.process_review(&input, &record)?;
            (record, result)
        }
        Some(record) => (record, scheduler.process_first_review(&input)?),
        None => (
            PracticeRecord::new_card(
                record_id,
                &review.repertoire_ref,
                &review.tune_ref,
                review.practiced,
            ),
            scheduler.process_first_review(&input)?,
        ),
    };
    result.apply_to(&mut record, &input);
    let saved = repo.save(record)?;

    if membership.scheduled.is_some() {
        repo.save(RepertoireTune {
            scheduled: None,
            ..membership
        })?;
    }
    repo.mark_queue_completed(&review.repertoire_ref, &review.tune_ref, review.practiced)?;

    info!(
        tune = %review.tune_ref,
        state = ?saved.state,
        due = %saved.due,
        "review recorded"
    );
    Ok(saved)
}
