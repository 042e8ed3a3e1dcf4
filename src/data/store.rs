use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::data::index::IndexSpace;
use crate::error::{RecError, Result};
use crate::models::{ItemMetadata, ProfileEntry, RawInteraction, TrainingPair, GENRE_DIM};

/// Ingestion counters reported alongside a loaded store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub interactions_kept: usize,
    pub dropped_missing_metadata: usize,
    /// Set when a `max_interactions` cap forced sampling, to the pre-cap count.
    pub sampled_down_from: Option<usize>,
}

/// In-memory interaction and catalog tables, keyed by dense indices.
///
/// Owns both `IndexSpace`s for its lifetime; a model trained against this
/// store is only valid for this store.
pub struct InteractionStore {
    users: IndexSpace,
    items: IndexSpace,
    pairs: Vec<TrainingPair>,
    profiles: Vec<Vec<ProfileEntry>>,
    titles: Vec<String>,
    release_years: Vec<Option<u16>>,
    genre_matrix: Arc<DMatrix<f32>>,
    user_aux: Arc<DMatrix<f32>>,
    summary: LoadSummary,
}

impl InteractionStore {
    /// Build the store from parsed records.
    ///
    /// Interactions referencing an item with no metadata are dropped and
    /// counted. When `max_interactions` is below the surviving count, a
    /// uniform random sample without replacement is taken with an rng seeded
    /// from `seed`, so the same inputs and seed always produce the same
    /// store.
    pub fn load(
        interactions: Vec<RawInteraction>,
        items: Vec<ItemMetadata>,
        max_interactions: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        let mut metadata: HashMap<u32, ItemMetadata> = HashMap::with_capacity(items.len());
        for item in items {
            if metadata.insert(item.item_id, item).is_some() {
                warn!("duplicate metadata for item, keeping the last record");
            }
        }

        let before = interactions.len();
        let mut kept: Vec<RawInteraction> = interactions
            .into_iter()
            .filter(|r| metadata.contains_key(&r.item_id))
            .collect();
        let dropped_missing_metadata = before - kept.len();

        let mut sampled_down_from = None;
        if let Some(cap) = max_interactions {
            if cap < kept.len() {
                sampled_down_from = Some(kept.len());
                let mut rng = StdRng::seed_from_u64(seed);
                let (sample, _) = kept.partial_shuffle(&mut rng, cap);
                let mut sample = sample.to_vec();
                // Normalize the sample order so downstream tables are stable.
                sample.sort_by_key(|r| (r.user_id, r.item_id, r.timestamp));
                kept = sample;
            }
        }

        if kept.is_empty() {
            return Err(RecError::EmptyInput {
                what: "interactions with catalog metadata",
            });
        }

        let users = IndexSpace::build(kept.iter().map(|r| r.user_id))?;
        let items = IndexSpace::build(kept.iter().map(|r| r.item_id))?;

        let mut pairs = Vec::with_capacity(kept.len());
        let mut profiles = vec![Vec::new(); users.len()];
        for record in &kept {
            let user = users.to_dense(record.user_id).expect("user id just indexed");
            let item = items.to_dense(record.item_id).expect("item id just indexed");
            pairs.push(TrainingPair { user, item });
            profiles[user].push(ProfileEntry {
                item,
                rating: record.rating,
                timestamp: record.timestamp,
            });
        }

        let mut titles = Vec::with_capacity(items.len());
        let mut release_years = Vec::with_capacity(items.len());
        let mut genre_matrix = DMatrix::zeros(items.len(), GENRE_DIM);
        for (dense, &external) in items.externals().iter().enumerate() {
            let meta = metadata.get(&external).expect("metadata presence filtered above");
            titles.push(meta.title.clone());
            release_years.push(meta.release_year);
            for (g, &flag) in meta.genres.iter().enumerate() {
                genre_matrix[(dense, g)] = flag as f32;
            }
        }

        let user_aux = build_user_aux(&profiles, &genre_matrix);

        let summary = LoadSummary {
            interactions_kept: kept.len(),
            dropped_missing_metadata,
            sampled_down_from,
        };
        info!(
            "store loaded: {} users, {} items, {} interactions ({} dropped without metadata)",
            users.len(),
            items.len(),
            summary.interactions_kept,
            summary.dropped_missing_metadata,
        );

        Ok(Self {
            users,
            items,
            pairs,
            profiles,
            titles,
            release_years,
            genre_matrix: Arc::new(genre_matrix),
            user_aux: Arc::new(user_aux),
            summary,
        })
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn user_index(&self) -> &IndexSpace {
        &self.users
    }

    pub fn item_index(&self) -> &IndexSpace {
        &self.items
    }

    /// One training pair per kept interaction.
    pub fn pairs(&self) -> &[TrainingPair] {
        &self.pairs
    }

    pub fn summary(&self) -> &LoadSummary {
        &self.summary
    }

    pub fn profile(&self, user: usize) -> Result<&[ProfileEntry]> {
        self.profiles
            .get(user)
            .map(Vec::as_slice)
            .ok_or(RecError::UnknownUser(user))
    }

    /// A user's history, oldest first.
    pub fn chronological(&self, user: usize) -> Result<Vec<ProfileEntry>> {
        let mut entries = self.profile(user)?.to_vec();
        entries.sort_by_key(|e| (e.timestamp, e.item));
        Ok(entries)
    }

    /// A user's own ratings ranked by rating descending, then recency
    /// descending, truncated to `k`.
    pub fn top_rated(&self, user: usize, k: usize) -> Result<Vec<ProfileEntry>> {
        let mut entries = self.profile(user)?.to_vec();
        entries.sort_by(|a, b| {
            b.rating
                .cmp(&a.rating)
                .then(b.timestamp.cmp(&a.timestamp))
                .then(a.item.cmp(&b.item))
        });
        entries.truncate(k);
        Ok(entries)
    }

    /// Dense indices of every item the user has rated, for exclusion.
    pub fn rated_items(&self, user: usize) -> Result<HashSet<usize>> {
        Ok(self.profile(user)?.iter().map(|e| e.item).collect())
    }

    pub fn title(&self, item: usize) -> Result<&str> {
        self.titles
            .get(item)
            .map(String::as_str)
            .ok_or(RecError::UnknownItem(item))
    }

    pub fn release_year(&self, item: usize) -> Result<Option<u16>> {
        self.release_years
            .get(item)
            .copied()
            .ok_or(RecError::UnknownItem(item))
    }

    /// Dense-item-indexed genre flags, `num_items x GENRE_DIM`.
    pub fn genre_matrix(&self) -> Arc<DMatrix<f32>> {
        Arc::clone(&self.genre_matrix)
    }

    /// Per-user normalized genre histogram, `num_users x GENRE_DIM`. This is
    /// the auxiliary user feature fed to the deep scoring path.
    pub fn user_aux(&self) -> Arc<DMatrix<f32>> {
        Arc::clone(&self.user_aux)
    }
}

fn build_user_aux(profiles: &[Vec<ProfileEntry>], genres: &DMatrix<f32>) -> DMatrix<f32> {
    let mut aux = DMatrix::zeros(profiles.len(), GENRE_DIM);
    for (user, entries) in profiles.iter().enumerate() {
        for entry in entries {
            for g in 0..GENRE_DIM {
                aux[(user, g)] += genres[(entry.item, g)];
            }
        }
        let total: f32 = aux.row(user).iter().sum();
        if total > 0.0 {
            for g in 0..GENRE_DIM {
                aux[(user, g)] /= total;
            }
        }
    }
    aux
}
