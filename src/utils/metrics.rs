use std::collections::{HashMap, HashSet};

use crate::models::RawInteraction;

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn precision_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if recommended.is_empty() {
            return 0.0;
        }
        let relevant: HashSet<_> = relevant.iter().collect();
        let hits = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count();
        hits as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn recall_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }
        let relevant_set: HashSet<_> = relevant.iter().collect();
        let hits = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant_set.contains(item))
            .count();
        hits as f64 / relevant.len() as f64
    }

    pub fn hit_at_k(&self, recommended: &[usize], target: usize) -> bool {
        recommended.iter().take(self.k).any(|&item| item == target)
    }

    pub fn ndcg_at_k(&self, recommended: &[usize], relevant_scores: &HashMap<usize, f64>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .map(|(i, item)| {
                relevant_scores.get(item).unwrap_or(&0.0) / ((i + 2) as f64).log2()
            })
            .sum();

        let mut ideal: Vec<f64> = relevant_scores.values().copied().collect();
        ideal.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let idcg: f64 = ideal
            .iter()
            .take(self.k)
            .enumerate()
            .map(|(i, score)| score / ((i + 2) as f64).log2())
            .sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }
}

/// Hold out each user's most recent interaction for evaluation.
///
/// Users with a single interaction stay entirely in the train split, so the
/// store never loses a user to the holdout.
pub fn leave_latest_split(
    interactions: &[RawInteraction],
) -> (Vec<RawInteraction>, Vec<RawInteraction>) {
    let mut latest: HashMap<u32, &RawInteraction> = HashMap::new();
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for record in interactions {
        *counts.entry(record.user_id).or_default() += 1;
        let slot = latest.entry(record.user_id).or_insert(record);
        if (record.timestamp, record.item_id) > ((*slot).timestamp, (*slot).item_id) {
            *slot = record;
        }
    }

    let mut train = Vec::with_capacity(interactions.len());
    let mut test = Vec::new();
    for record in interactions {
        let held_out = counts[&record.user_id] > 1 && latest[&record.user_id] == record;
        if held_out {
            test.push(record.clone());
        } else {
            train.push(record.clone());
        }
    }
    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_and_recall() {
        let calc = MetricsCalculator::new(3);
        let recommended = vec![1, 2, 3];
        let relevant = vec![1, 3];
        assert!((calc.precision_at_k(&recommended, &relevant) - 2.0 / 3.0).abs() < 1e-9);
        assert!((calc.recall_at_k(&recommended, &relevant) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_respects_k() {
        let calc = MetricsCalculator::new(2);
        assert!(calc.hit_at_k(&[5, 9, 7], 9));
        assert!(!calc.hit_at_k(&[5, 9, 7], 7));
    }

    #[test]
    fn test_ndcg_bounds() {
        let calc = MetricsCalculator::new(3);
        let mut scores = HashMap::new();
        scores.insert(1usize, 1.0);
        scores.insert(2, 0.5);
        let perfect = calc.ndcg_at_k(&[1, 2], &scores);
        let reversed = calc.ndcg_at_k(&[2, 1], &scores);
        assert!((perfect - 1.0).abs() < 1e-9);
        assert!(reversed < perfect);
        assert!(reversed > 0.0);
    }

    #[test]
    fn test_leave_latest_split() {
        let records = vec![
            RawInteraction { user_id: 1, item_id: 10, rating: 4, timestamp: 100 },
            RawInteraction { user_id: 1, item_id: 11, rating: 5, timestamp: 200 },
            RawInteraction { user_id: 2, item_id: 10, rating: 3, timestamp: 50 },
        ];
        let (train, test) = leave_latest_split(&records);
        // User 2 has one interaction and is never held out.
        assert_eq!(train.len(), 2);
        assert_eq!(test.len(), 1);
        assert_eq!(test[0].item_id, 11);
    }
}
