//! Practice operations: reviews, the daily list and staged feedback.

pub mod feedback;
pub mod queue;
pub mod review;

pub use feedback::{FeedbackCache, FlushReport, QueueKey};
pub use queue::{add_tunes_to_queue, get_practice_list, AddTunesResult};
pub use review::{practice_record_id, submit_review, SubmitReview};
