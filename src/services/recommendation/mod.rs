use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::RetrievalModel;
use crate::data::InteractionStore;
use crate::error::{RecError, Result};
use crate::models::RankedItem;
use crate::utils::cosine_similarity;

/// One row of a user's displayed rating history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedItem {
    pub item: usize,
    pub external_id: u32,
    pub title: String,
    pub rating: u8,
    pub timestamp: i64,
}

/// Serves exhaustive top-k queries over a trained model and its store.
///
/// Construction rejects a model whose catalog does not match the store, so a
/// rebuilt index space can never be read through stale embeddings.
pub struct Recommender<'a> {
    store: &'a InteractionStore,
    model: &'a dyn RetrievalModel,
    chunk_size: usize,
}

impl std::fmt::Debug for Recommender<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recommender").finish_non_exhaustive()
    }
}

impl<'a> Recommender<'a> {
    pub fn new(
        store: &'a InteractionStore,
        model: &'a dyn RetrievalModel,
        chunk_size: usize,
    ) -> Result<Self> {
        if model.num_items() != store.num_items() || model.num_users() != store.num_users() {
            return Err(RecError::StaleModel {
                model_items: model.num_items(),
                store_items: store.num_items(),
            });
        }
        Ok(Self {
            store,
            model,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Top-k items for a user, scored over the whole catalog minus
    /// `exclude`. Exclusion happens before ranking, so the result only falls
    /// short of `k` when fewer unseen items exist. Ties break toward the
    /// lower item index.
    pub fn recommend(
        &self,
        user: usize,
        exclude: &HashSet<usize>,
        k: usize,
    ) -> Result<Vec<RankedItem>> {
        if user >= self.store.num_users() {
            return Err(RecError::UnknownUser(user));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let num_items = self.store.num_items();
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
        let mut chunk = Vec::with_capacity(self.chunk_size);

        // Sweep the catalog in bounded chunks; only survivors get scored.
        let mut start = 0;
        while start < num_items {
            let end = (start + self.chunk_size).min(num_items);
            chunk.clear();
            chunk.extend((start..end).filter(|item| !exclude.contains(item)));
            start = end;
            if chunk.is_empty() {
                continue;
            }

            let scores = self.model.score_user(user, &chunk)?;
            for (slot, &item) in chunk.iter().enumerate() {
                push_candidate(
                    &mut heap,
                    Candidate {
                        score: scores[slot],
                        item,
                    },
                    k,
                );
            }
        }

        self.drain_ranked(heap)
    }

    /// Recommend excluding everything the user has already rated.
    pub fn recommend_unseen(&self, user: usize, k: usize) -> Result<Vec<RankedItem>> {
        let rated = self.store.rated_items(user)?;
        self.recommend(user, &rated, k)
    }

    /// The user's own ratings, best first: rating descending, then most
    /// recent first.
    pub fn top_rated_history(&self, user: usize, k: usize) -> Result<Vec<RatedItem>> {
        self.store
            .top_rated(user, k)?
            .into_iter()
            .map(|entry| {
                Ok(RatedItem {
                    item: entry.item,
                    external_id: self
                        .store
                        .item_index()
                        .to_external(entry.item)
                        .ok_or(RecError::UnknownItem(entry.item))?,
                    title: self.store.title(entry.item)?.to_string(),
                    rating: entry.rating,
                    timestamp: entry.timestamp,
                })
            })
            .collect()
    }

    /// Nearest catalog neighbors of an item in embedding space, by cosine
    /// similarity, excluding the item itself.
    pub fn similar_items(&self, item: usize, k: usize) -> Result<Vec<RankedItem>> {
        let num_items = self.store.num_items();
        if item >= num_items {
            return Err(RecError::UnknownItem(item));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = self.model.embed_items(&[item])?;
        let query = query.row(0).transpose();

        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
        let mut start = 0;
        while start < num_items {
            let end = (start + self.chunk_size).min(num_items);
            let chunk: Vec<usize> = (start..end).filter(|&other| other != item).collect();
            start = end;
            if chunk.is_empty() {
                continue;
            }

            let rows = self.model.embed_items(&chunk)?;
            for (slot, &other) in chunk.iter().enumerate() {
                let score =
                    cosine_similarity(query.as_slice(), rows.row(slot).transpose().as_slice());
                push_candidate(&mut heap, Candidate { score, item: other }, k);
            }
        }

        self.drain_ranked(heap)
    }

    /// Pick a random user with enough history to make an interesting demo.
    pub fn sample_eligible_user<R: Rng>(&self, min_ratings: usize, rng: &mut R) -> Option<usize> {
        let eligible: Vec<usize> = (0..self.store.num_users())
            .filter(|&user| {
                self.store
                    .profile(user)
                    .map(|entries| entries.len() >= min_ratings)
                    .unwrap_or(false)
            })
            .collect();
        eligible.choose(rng).copied()
    }

    fn drain_ranked(&self, heap: BinaryHeap<Reverse<Candidate>>) -> Result<Vec<RankedItem>> {
        let mut winners: Vec<Candidate> = heap.into_iter().map(|entry| entry.0).collect();
        winners.sort_by(|a, b| b.cmp(a));
        winners
            .into_iter()
            .map(|candidate| {
                Ok(RankedItem {
                    item: candidate.item,
                    external_id: self
                        .store
                        .item_index()
                        .to_external(candidate.item)
                        .ok_or(RecError::UnknownItem(candidate.item))?,
                    title: self.store.title(candidate.item)?.to_string(),
                    score: candidate.score,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    item: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Higher score wins; equal scores prefer the lower item index.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.item.cmp(&self.item))
    }
}

fn push_candidate(heap: &mut BinaryHeap<Reverse<Candidate>>, candidate: Candidate, k: usize) {
    if heap.len() < k {
        heap.push(Reverse(candidate));
    } else if let Some(weakest) = heap.peek() {
        if candidate > weakest.0 {
            heap.pop();
            heap.push(Reverse(candidate));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::TwoTowerModel;
    use crate::models::{ItemMetadata, RawInteraction, GENRE_DIM};

    fn store_with(num_users: u32, num_items: u32) -> InteractionStore {
        let mut interactions = Vec::new();
        for user in 0..num_users {
            for item in 0..num_items {
                interactions.push(RawInteraction {
                    user_id: user + 1,
                    item_id: item + 1,
                    rating: 1 + ((user + item) % 5) as u8,
                    timestamp: 1000 + (user * num_items + item) as i64,
                });
            }
        }
        let items = (0..num_items)
            .map(|item| ItemMetadata {
                item_id: item + 1,
                title: format!("Item {}", item + 1),
                release_year: None,
                genres: [0u8; GENRE_DIM],
            })
            .collect();
        InteractionStore::load(interactions, items, None, 1).unwrap()
    }

    #[test]
    fn test_excluded_items_never_returned() {
        let store = store_with(2, 8);
        let model = TwoTowerModel::new(2, 8, 4, 1);
        let rec = Recommender::new(&store, &model, 3).unwrap();

        let exclude: HashSet<usize> = [0, 2, 4].into_iter().collect();
        let results = rec.recommend(0, &exclude, 5).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| !exclude.contains(&r.item)));
    }

    #[test]
    fn test_exact_k_when_enough_candidates() {
        let store = store_with(1, 10);
        let model = TwoTowerModel::new(1, 10, 4, 1);
        let rec = Recommender::new(&store, &model, 4).unwrap();

        let exclude: HashSet<usize> = [1, 3].into_iter().collect();
        // 8 candidates survive exclusion, so exactly 4 come back.
        assert_eq!(rec.recommend(0, &exclude, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_fewer_than_k_without_padding() {
        let store = store_with(1, 4);
        let model = TwoTowerModel::new(1, 4, 4, 1);
        let rec = Recommender::new(&store, &model, 2).unwrap();

        let exclude: HashSet<usize> = [0, 1].into_iter().collect();
        assert_eq!(rec.recommend(0, &exclude, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_results_sorted_and_ties_break_on_item_index() {
        let store = store_with(1, 6);
        // Zero-dimension embeddings make every score identical.
        let model = TwoTowerModel::new(1, 6, 0, 1);
        let rec = Recommender::new(&store, &model, 2).unwrap();

        let picked: Vec<usize> = rec
            .recommend(0, &HashSet::new(), 3)
            .unwrap()
            .iter()
            .map(|r| r.item)
            .collect();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_user_rejected() {
        let store = store_with(2, 4);
        let model = TwoTowerModel::new(2, 4, 4, 1);
        let rec = Recommender::new(&store, &model, 8).unwrap();
        assert!(matches!(
            rec.recommend(9, &HashSet::new(), 3).unwrap_err(),
            RecError::UnknownUser(9)
        ));
    }

    #[test]
    fn test_stale_model_rejected() {
        let store = store_with(2, 4);
        let model = TwoTowerModel::new(2, 7, 4, 1);
        assert!(matches!(
            Recommender::new(&store, &model, 8).unwrap_err(),
            RecError::StaleModel { .. }
        ));
    }

    #[test]
    fn test_similar_items_excludes_query() {
        let store = store_with(2, 6);
        let model = TwoTowerModel::new(2, 6, 8, 1);
        let rec = Recommender::new(&store, &model, 2).unwrap();

        let neighbors = rec.similar_items(3, 4).unwrap();
        assert_eq!(neighbors.len(), 4);
        assert!(neighbors.iter().all(|n| n.item != 3));
    }

    #[test]
    fn test_eligible_user_threshold() {
        let store = store_with(3, 5);
        let model = TwoTowerModel::new(3, 5, 4, 1);
        let rec = Recommender::new(&store, &model, 8).unwrap();
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);

        // Every user rated 5 items.
        assert!(rec.sample_eligible_user(5, &mut rng).is_some());
        assert!(rec.sample_eligible_user(6, &mut rng).is_none());
    }
}
