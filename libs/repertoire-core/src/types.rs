//! Core types shared by the local engine and the sync server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::sync::SyncMeta;

/// Card learning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardState {
    #[default]
    New,
    Learning,
    Review,
    Relearning,
}

impl CardState {
    /// Numeric code used by the local store.
    pub fn to_value(self) -> i64 {
        match self {
            Self::New => 0,
            Self::Learning => 1,
            Self::Review => 2,
            Self::Relearning => 3,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::New),
            1 => Some(Self::Learning),
            2 => Some(Self::Review),
            3 => Some(Self::Relearning),
            _ => None,
        }
    }
}

/// Rating for a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Again,
    Hard,
    Good,
    Easy,
}

impl Rating {
    /// Convert to 4-point numeric value (1-4).
    pub fn to_value(self) -> u8 {
        match self {
            Self::Again => 1,
            Self::Hard => 2,
            Self::Good => 3,
            Self::Easy => 4,
        }
    }

    /// Create from 4-point numeric value.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Again),
            2 => Some(Self::Hard),
            3 => Some(Self::Good),
            4 => Some(Self::Easy),
            _ => None,
        }
    }

    /// Map a 0-5 quality input to a rating.
    ///
    /// The mapping is direct, so 0 and 5 have no rating and are rejected.
    pub fn from_quality(quality: u8) -> Result<Self, ScheduleError> {
        Self::from_value(quality).ok_or(ScheduleError::InvalidRating { quality })
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Good | Self::Easy)
    }
}

/// What the player is working towards with a tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    #[default]
    Recall,
    InitialLearn,
    Fluency,
    SessionReady,
    PerformancePolish,
}

impl Goal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recall => "recall",
            Self::InitialLearn => "initial_learn",
            Self::Fluency => "fluency",
            Self::SessionReady => "session_ready",
            Self::PerformancePolish => "performance_polish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recall" => Some(Self::Recall),
            "initial_learn" => Some(Self::InitialLearn),
            "fluency" => Some(Self::Fluency),
            "session_ready" => Some(Self::SessionReady),
            "performance_polish" => Some(Self::PerformancePolish),
            _ => None,
        }
    }
}

/// Algorithm options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "FSRS")]
    Fsrs,
}

impl Algorithm {
    /// Get the algorithm name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fsrs => "FSRS",
        }
    }

    /// Parse from string, case-insensitively.
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        if s.eq_ignore_ascii_case("fsrs") {
            Ok(Self::Fsrs)
        } else {
            Err(ScheduleError::UnsupportedAlgorithm(s.to_string()))
        }
    }
}

/// A tune in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tune {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub genre: Option<String>,
    pub sync: SyncMeta,
}

/// A user's repertoire (a playlist of tunes being practiced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Repertoire {
    pub id: String,
    pub user_ref: String,
    pub name: String,
    pub sync: SyncMeta,
}

/// Membership of a tune in a repertoire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepertoireTune {
    pub id: String,
    pub repertoire_ref: String,
    pub tune_ref: String,
    /// Explicit "practice this now" override set by add-to-review.
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
    pub sync: SyncMeta,
}

/// The scheduling card for one tune in one repertoire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PracticeRecord {
    pub id: String,
    pub tune_ref: String,
    pub repertoire_ref: String,
    #[serde(default)]
    pub practiced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub difficulty: Option<f64>,
    #[serde(default)]
    pub stability: Option<f64>,
    pub interval: i64,
    pub elapsed_days: f64,
    pub repetitions: u32,
    pub lapses: u32,
    pub state: CardState,
    pub due: DateTime<Utc>,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default)]
    pub technique: Option<String>,
    /// Step counter for goal-based interval tables.
    #[serde(default)]
    pub step: u32,
    pub sync: SyncMeta,
}

impl PracticeRecord {
    /// An unpracticed card due at `due`.
    pub fn new_card(
        id: String,
        repertoire_ref: &str,
        tune_ref: &str,
        due: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tune_ref: tune_ref.to_string(),
            repertoire_ref: repertoire_ref.to_string(),
            practiced: None,
            quality: None,
            difficulty: None,
            stability: None,
            interval: 0,
            elapsed_days: 0.0,
            repetitions: 0,
            lapses: 0,
            state: CardState::New,
            due,
            goal: Goal::default(),
            technique: None,
            step: 0,
            sync: SyncMeta::new(due),
        }
    }

    pub fn is_practiced(&self) -> bool {
        self.practiced.is_some()
    }
}

/// Daily queue bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    DueToday,
    Lapsed,
    New,
    OldLapsed,
}

impl Bucket {
    /// Primary sort key of the queue.
    pub fn rank(self) -> i64 {
        match self {
            Self::DueToday => 1,
            Self::Lapsed => 2,
            Self::New => 3,
            Self::OldLapsed => 4,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(Self::DueToday),
            2 => Some(Self::Lapsed),
            3 => Some(Self::New),
            4 => Some(Self::OldLapsed),
            _ => None,
        }
    }
}

/// One row of a frozen daily practice queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyPracticeQueueEntry {
    pub id: String,
    pub user_ref: String,
    pub repertoire_ref: String,
    pub tune_ref: String,
    pub queue_date: String,
    pub window_start_utc: DateTime<Utc>,
    pub window_end_utc: DateTime<Utc>,
    pub bucket: Bucket,
    pub order_index: i64,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub sync: SyncMeta,
}

/// Per-user spaced repetition preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefsSpacedRepetition {
    /// Keyed by user.
    pub id: String,
    pub alg_type: String,
    #[serde(default)]
    pub weights: Vec<f64>,
    pub request_retention: f64,
    pub maximum_interval: u32,
    /// Learning steps in minutes.
    #[serde(default)]
    pub learning_steps: Vec<f64>,
    /// Relearning steps in minutes.
    #[serde(default)]
    pub relearning_steps: Vec<f64>,
    pub enable_fuzzing: bool,
    pub sync: SyncMeta,
}

impl PrefsSpacedRepetition {
    pub const DEFAULT_RETENTION: f64 = 0.9;
    pub const DEFAULT_MAXIMUM_INTERVAL: u32 = 36500;

    /// Documented defaults for a user with no stored preferences.
    pub fn defaults_for(user_ref: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: user_ref.to_string(),
            alg_type: Algorithm::Fsrs.as_str().to_string(),
            weights: Vec::new(),
            request_retention: Self::DEFAULT_RETENTION,
            maximum_interval: Self::DEFAULT_MAXIMUM_INTERVAL,
            learning_steps: vec![1.0, 10.0],
            relearning_steps: vec![10.0],
            enable_fuzzing: true,
            sync: SyncMeta::new(now),
        }
    }
}

/// Per-user queue sizing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSchedulingOptions {
    /// Keyed by user.
    pub id: String,
    /// Days a tune may be overdue and still count as recently lapsed.
    pub acceptable_delinquency_window: u32,
    pub min_reviews_per_day: u32,
    /// Zero means unlimited.
    pub max_reviews_per_day: u32,
    pub auto_schedule_new: bool,
    pub sync: SyncMeta,
}

impl UserSchedulingOptions {
    pub fn defaults_for(user_ref: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: user_ref.to_string(),
            acceptable_delinquency_window: 7,
            min_reviews_per_day: 5,
            max_reviews_per_day: 20,
            auto_schedule_new: true,
            sync: SyncMeta::new(now),
        }
    }
}
