use serde::{Deserialize, Serialize};

use crate::error::{RecError, Result};

/// Width of the binary genre-flag vector carried by every item record.
pub const GENRE_DIM: usize = 19;

/// One observed user-item interaction, exactly as parsed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInteraction {
    pub user_id: u32,
    pub item_id: u32,
    pub rating: u8,
    pub timestamp: i64,
}

/// Catalog metadata for a single item.
///
/// `title` has any trailing "(YYYY)" annotation stripped; the year, when
/// present, lands in `release_year`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_id: u32,
    pub title: String,
    pub release_year: Option<u16>,
    pub genres: [u8; GENRE_DIM],
}

/// A (user, positive item) training example in dense index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrainingPair {
    pub user: usize,
    pub item: usize,
}

/// One mini-batch of training pairs, with optional sampled negatives.
///
/// `users` and `positives` are parallel; `negatives` is either empty or
/// holds `negatives_per_positive` item indices per pair, grouped by pair.
#[derive(Debug, Clone)]
pub struct LossBatch {
    pub users: Vec<usize>,
    pub positives: Vec<usize>,
    pub negatives: Vec<usize>,
    pub negatives_per_positive: usize,
}

impl LossBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Fail fast if the parallel arrays disagree.
    pub fn check_shape(&self) -> Result<()> {
        if self.users.len() != self.positives.len() {
            return Err(RecError::BatchShape {
                context: "users vs positives",
                left: self.users.len(),
                right: self.positives.len(),
            });
        }
        let expected = self.users.len() * self.negatives_per_positive;
        if self.negatives.len() != expected {
            return Err(RecError::BatchShape {
                context: "sampled negatives",
                left: self.negatives.len(),
                right: expected,
            });
        }
        Ok(())
    }
}

/// One entry of a user's rating history, in dense item space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub item: usize,
    pub rating: u8,
    pub timestamp: i64,
}

/// A scored catalog item, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub item: usize,
    pub external_id: u32,
    pub title: String,
    pub score: f32,
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub batches_run: usize,
    pub skipped_batches: usize,
    pub loss_history: Vec<f32>,
    pub cancelled: bool,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.loss_history.last().copied()
    }

    pub fn mean_loss(&self) -> Option<f32> {
        if self.loss_history.is_empty() {
            return None;
        }
        let sum: f32 = self.loss_history.iter().sum();
        Some(sum / self.loss_history.len() as f32)
    }
}
