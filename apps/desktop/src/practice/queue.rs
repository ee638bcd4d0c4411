//! Daily practice list: read the frozen queue, generating it on first use.

use chrono::{DateTime, Utc};
use repertoire_core::{
    plan_queue, PracticeRecord, PracticeWindow, QueueLimits, RepertoireTune,
    UserSchedulingOptions,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::review::practice_record_id;
use crate::db::{DbError, PracticeListRow, PracticeRepository, QueueRepository, SqliteRepository};

type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddTunesResult {
    pub added: usize,
    pub skipped: usize,
    /// Tunes that were scheduled, in request order.
    pub tune_ids: Vec<String>,
}

fn scheduling_options(repo: &SqliteRepository, user_ref: &str) -> Result<UserSchedulingOptions> {
    Ok(repo
        .get_scheduling_options(user_ref)?
        .unwrap_or_else(|| UserSchedulingOptions::defaults_for(user_ref, repo.now())))
}

fn generate(
    repo: &SqliteRepository,
    user_ref: &str,
    repertoire_ref: &str,
    window: &PracticeWindow,
    options: &UserSchedulingOptions,
) -> Result<Vec<PracticeListRow>> {
    let candidates = repo.queue_candidates(repertoire_ref)?;
    let planned = plan_queue(window, &candidates, QueueLimits::from(options));
    repo.persist_queue(user_ref, repertoire_ref, window, &planned)?;
    info!(
        repertoire = repertoire_ref,
        date = %window.queue_date(),
        size = planned.len(),
        "generated daily queue"
    );
    repo.active_queue(user_ref, repertoire_ref, window.start)
}

/// Today's (or `window_start`'s) practice list in queue order.
///
/// The first read of a window freezes it, even when it comes out empty;
/// later reads return the stored snapshot unchanged until it is invalidated.
/// Past windows are only ever read, never generated. If generation fails,
/// the most recent frozen queue is returned instead.
pub fn get_practice_list(
    repo: &SqliteRepository,
    user_ref: &str,
    repertoire_ref: &str,
    window_start: Option<DateTime<Utc>>,
) -> Result<Vec<PracticeListRow>> {
    let options = scheduling_options(repo, user_ref)?;
    let delinquency = options.acceptable_delinquency_window;
    let window = match window_start {
        Some(start) => PracticeWindow::starting_at(start, delinquency),
        None => PracticeWindow::containing(repo.now(), delinquency),
    };

    let frozen = repo.active_queue(user_ref, repertoire_ref, window.start)?;
    if !frozen.is_empty() || repo.queue_generated(user_ref, repertoire_ref, window.start)? {
        debug!(repertoire = repertoire_ref, size = frozen.len(), "serving frozen queue");
        return Ok(frozen);
    }

    let current = PracticeWindow::containing(repo.now(), delinquency);
    if window.start < current.start {
        debug!(
            repertoire = repertoire_ref,
            date = %window.queue_date(),
            "no frozen queue for past window"
        );
        return Ok(frozen);
    }

    match generate(repo, user_ref, repertoire_ref, &window, &options) {
        Ok(rows) => Ok(rows),
        Err(e) => {
            let fallback = repo.latest_active_queue(user_ref, repertoire_ref)?;
            if fallback.is_empty() {
                return Err(e);
            }
            warn!(
                repertoire = repertoire_ref,
                error = %e,
                queue_date = %fallback[0].queue_date,
                "queue generation failed, serving last frozen queue"
            );
            Ok(fallback)
        }
    }
}

/// Request review of `tune_ids` today.
///
/// Tunes outside the repertoire are skipped. Today's queue is invalidated so
/// the next read picks the tunes up.
pub fn add_tunes_to_queue(
    repo: &SqliteRepository,
    repertoire_ref: &str,
    tune_ids: &[String],
) -> Result<AddTunesResult> {
    let repertoire = repo
        .get_repertoire(repertoire_ref)?
        .ok_or_else(|| DbError::Validation(format!("unknown repertoire {repertoire_ref}")))?;
    let options = scheduling_options(repo, &repertoire.user_ref)?;
    let now = repo.now();

    let mut result = AddTunesResult {
        added: 0,
        skipped: 0,
        tune_ids: Vec::new(),
    };
    for tune_id in tune_ids {
        let Some(membership) = repo.get_repertoire_tune(repertoire_ref, tune_id)? else {
            result.skipped += 1;
            continue;
        };
        repo.save(RepertoireTune {
            scheduled: Some(now),
            ..membership
        })?;

        match repo.get_practice_record(repertoire_ref, tune_id)? {
            Some(mut record) => {
                record.due = now;
                repo.save(record)?;
            }
            None if options.auto_schedule_new => {
                repo.save(PracticeRecord::new_card(
                    practice_record_id(repertoire_ref, tune_id),
                    repertoire_ref,
                    tune_id,
                    now,
                ))?;
            }
            None => {}
        }
        result.added += 1;
        result.tune_ids.push(tune_id.clone());
    }

    if result.added > 0 {
        let window = PracticeWindow::containing(now, options.acceptable_delinquency_window);
        let invalidated = repo.invalidate_queue(&repertoire.user_ref, repertoire_ref, window.start)?;
        debug!(invalidated, "invalidated today's queue");
    }
    Ok(result)
}
