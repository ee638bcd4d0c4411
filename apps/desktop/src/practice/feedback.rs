//! Staged review feedback.
//!
//! Reviews can be staged in memory and written later in one transaction per
//! practice day. At most one flush per key runs at a time.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use repertoire_core::Rating;
use serde::Serialize;
use tracing::{debug, warn};

use super::review::{submit_review, SubmitReview};
use crate::db::{DbError, SqliteRepository};

/// Staging key: one user's repertoire on one practice day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueueKey {
    pub user_ref: String,
    pub repertoire_ref: String,
    pub queue_date: String,
}

impl QueueKey {
    pub fn for_review(review: &SubmitReview) -> Self {
        Self {
            user_ref: review.user_ref.clone(),
            repertoire_ref: review.repertoire_ref.clone(),
            queue_date: review.practiced.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    /// Reviews dropped because they can never be written.
    pub rejected: usize,
    /// Keys left for a later flush because another flush holds them.
    pub busy_keys: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FeedbackCache {
    staged: Mutex<HashMap<QueueKey, Vec<SubmitReview>>>,
    inflight: Mutex<HashSet<QueueKey>>,
}

struct Inflight<'a> {
    set: &'a Mutex<HashSet<QueueKey>>,
    key: QueueKey,
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl FeedbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a review for the next flush. The rating is checked immediately.
    pub fn stage(&self, review: SubmitReview) -> Result<QueueKey, DbError> {
        Rating::from_quality(review.quality)?;
        let key = QueueKey::for_review(&review);
        self.staged
            .lock()
            .entry(key.clone())
            .or_default()
            .push(review);
        Ok(key)
    }

    pub fn staged_count(&self) -> usize {
        self.staged.lock().values().map(Vec::len).sum()
    }

    pub fn is_inflight(&self, key: &QueueKey) -> bool {
        self.inflight.lock().contains(key)
    }

    fn claim(&self, key: &QueueKey) -> Option<Inflight<'_>> {
        if !self.inflight.lock().insert(key.clone()) {
            return None;
        }
        Some(Inflight {
            set: &self.inflight,
            key: key.clone(),
        })
    }

    fn restage(&self, key: QueueKey, reviews: Vec<SubmitReview>) {
        let mut staged = self.staged.lock();
        let slot = staged.entry(key).or_default();
        let newer = std::mem::take(slot);
        *slot = reviews;
        slot.extend(newer);
    }

    /// Write every staged review, one transaction per key.
    ///
    /// Reviews the store refuses are dropped. A storage error rolls the whole
    /// key back and returns its reviews to the cache in order.
    pub fn flush(&self, repo: &SqliteRepository) -> FlushReport {
        let mut report = FlushReport::default();
        let keys: Vec<QueueKey> = self.staged.lock().keys().cloned().collect();

        for key in keys {
            let Some(_claim) = self.claim(&key) else {
                report.busy_keys += 1;
                continue;
            };
            let mut reviews = self.staged.lock().remove(&key).unwrap_or_default();
            reviews.sort_by_key(|r| r.practiced);

            let mut written = 0;
            let mut refused = Vec::new();
            let outcome = repo.in_transaction(|| {
                for review in &reviews {
                    match submit_review(repo, review) {
                        Ok(_) => written += 1,
                        Err(e @ (DbError::Validation(_) | DbError::Schedule(_))) => {
                            refused.push((review.tune_ref.clone(), e));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            });

            match outcome {
                Ok(()) => {
                    report.flushed += written;
                    for (tune, e) in refused {
                        warn!(tune = %tune, error = %e, "dropping staged review");
                        report.rejected += 1;
                        report.errors.push(e.to_string());
                    }
                }
                Err(e) => {
                    warn!(queue_date = %key.queue_date, error = %e, "flush failed, restaging");
                    report.errors.push(e.to_string());
                    self.restage(key.clone(), reviews);
                }
            }
        }

        if report.flushed > 0 {
            debug!(flushed = report.flushed, "flushed staged feedback");
        }
        report
    }
}
