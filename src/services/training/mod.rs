use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, info};

use crate::algorithms::optimizer::{Adam, Optimizer, Sgd};
use crate::algorithms::RetrievalModel;
use crate::config::{LossMode, OptimizerKind, TrainingConfig};
use crate::error::{RecError, Result};
use crate::models::{LossBatch, TrainReport};
use crate::sampler::BatchSampler;
use crate::utils::sigmoid;

/// Stability floor inside the pairwise log term. Strictly numerical; small
/// enough to never shift the loss by more than noise.
const PAIRWISE_EPS: f32 = 1e-9;

/// Cooperative cancellation flag, checked between batches only; a batch that
/// has started always runs to completion.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs epochs of mini-batch gradient descent against a retrieval model.
pub struct Trainer {
    epochs: usize,
    loss_mode: LossMode,
    optimizer: Box<dyn Optimizer>,
}

impl Trainer {
    pub fn new(cfg: &TrainingConfig) -> Self {
        let optimizer: Box<dyn Optimizer> = match cfg.optimizer {
            OptimizerKind::Sgd => Box::new(Sgd::new(cfg.learning_rate)),
            OptimizerKind::Adam => Box::new(Adam::with_learning_rate(cfg.learning_rate)),
        };
        Self {
            epochs: cfg.epochs,
            loss_mode: cfg.loss_mode,
            optimizer,
        }
    }

    /// Train for the configured number of epochs, yielding to the runtime
    /// between batches so the host stays responsive.
    pub async fn run(
        &mut self,
        model: &mut dyn RetrievalModel,
        sampler: &mut BatchSampler,
        cancel: &CancelToken,
    ) -> Result<TrainReport> {
        let mut report = TrainReport::default();

        for epoch in 0..self.epochs {
            let mut epoch_loss = 0.0f32;
            let mut epoch_batches = 0usize;

            for (batch_no, batch) in sampler.epoch().enumerate() {
                if cancel.is_cancelled() {
                    info!("training cancelled at epoch {epoch}, batch {batch_no}");
                    report.cancelled = true;
                    return Ok(report);
                }

                match self.step_batch(model, &batch, epoch, batch_no)? {
                    Some(loss) => {
                        debug!("epoch {epoch} batch {batch_no}: loss {loss:.5}");
                        report.loss_history.push(loss);
                        report.batches_run += 1;
                        epoch_loss += loss;
                        epoch_batches += 1;
                    }
                    None => report.skipped_batches += 1,
                }

                tokio::task::yield_now().await;
            }

            report.epochs_run += 1;
            if epoch_batches > 0 {
                info!(
                    "epoch {epoch} complete: mean loss {:.5} over {epoch_batches} batches",
                    epoch_loss / epoch_batches as f32
                );
            }
        }

        Ok(report)
    }

    /// One gradient step. Returns `None` when the batch is skipped for the
    /// active loss mode, `Err(Divergence)` before any parameter update when
    /// the loss comes out non-finite.
    fn step_batch(
        &mut self,
        model: &mut dyn RetrievalModel,
        batch: &LossBatch,
        epoch: usize,
        batch_no: usize,
    ) -> Result<Option<f32>> {
        batch.check_shape()?;

        let loss = match self.loss_mode {
            LossMode::InBatchSoftmax => self.softmax_step(model, batch)?,
            LossMode::Pairwise => self.pairwise_step(model, batch)?,
        };

        if let Some(loss) = loss {
            if !loss.is_finite() {
                return Err(RecError::Divergence {
                    epoch,
                    batch: batch_no,
                    loss,
                });
            }
        }
        Ok(loss)
    }

    /// In-batch softmax: S = U.P^T, row i's target is the diagonal, so every
    /// other row's positive acts as a negative for row i. Two rows sharing a
    /// positive item keep their diagonal targets.
    fn softmax_step(
        &mut self,
        model: &mut dyn RetrievalModel,
        batch: &LossBatch,
    ) -> Result<Option<f32>> {
        let b = batch.len();
        if b < 2 {
            // A single pair has no in-batch negatives to contrast against.
            return Ok(None);
        }

        let scores = model.score_matrix(&batch.users, &batch.positives)?;

        let mut probs = scores.clone();
        let mut loss = 0.0f32;
        for i in 0..b {
            let row_max = scores.row(i).max();
            let mut sum = 0.0f32;
            for j in 0..b {
                let e = (scores[(i, j)] - row_max).exp();
                probs[(i, j)] = e;
                sum += e;
            }
            for j in 0..b {
                probs[(i, j)] /= sum;
            }
            loss -= scores[(i, i)] - row_max - sum.ln();
        }
        let loss = loss / b as f32;
        if !loss.is_finite() {
            return Ok(Some(loss));
        }

        // dLoss/dS = (softmax(S) - I) / B
        let mut upstream = probs;
        for i in 0..b {
            upstream[(i, i)] -= 1.0;
        }
        upstream /= b as f32;

        model.backward_matrix(
            &batch.users,
            &batch.positives,
            &upstream,
            self.optimizer.as_mut(),
        )?;
        Ok(Some(loss))
    }

    /// Pairwise ranking: -ln(sigmoid(sPos - sNeg) + eps) per example.
    /// Sampled negatives expand to one example per (pair, negative); without
    /// sampled negatives each pair borrows the next pair's positive.
    fn pairwise_step(
        &mut self,
        model: &mut dyn RetrievalModel,
        batch: &LossBatch,
    ) -> Result<Option<f32>> {
        let b = batch.len();
        let npp = batch.negatives_per_positive;

        let (users, positives, negatives) = if npp > 0 {
            let mut users = Vec::with_capacity(b * npp);
            let mut positives = Vec::with_capacity(b * npp);
            for k in 0..b {
                for _ in 0..npp {
                    users.push(batch.users[k]);
                    positives.push(batch.positives[k]);
                }
            }
            (users, positives, batch.negatives.clone())
        } else {
            if b < 2 {
                // The shifted-positive fallback needs a second pair.
                return Ok(None);
            }
            let negatives = (0..b).map(|k| batch.positives[(k + 1) % b]).collect();
            (batch.users.clone(), batch.positives.clone(), negatives)
        };

        let s_pos = model.score_pairs(&users, &positives)?;
        let s_neg = model.score_pairs(&users, &negatives)?;

        let count = users.len();
        let mut loss = 0.0f32;
        let mut d_pos = DVector::zeros(count);
        for k in 0..count {
            let sig = sigmoid(s_pos[k] - s_neg[k]);
            loss -= (sig + PAIRWISE_EPS).ln();
            // d/d(sPos) of -ln(sigmoid(diff) + eps)
            d_pos[k] = -(sig * (1.0 - sig)) / (sig + PAIRWISE_EPS) / count as f32;
        }
        let loss = loss / count as f32;
        if !loss.is_finite() {
            return Ok(Some(loss));
        }

        // One combined step: positive and negative terms with opposite signs.
        let mut all_users = users.clone();
        all_users.extend_from_slice(&users);
        let mut all_items = positives;
        all_items.extend(negatives);
        let mut upstream = DVector::zeros(2 * count);
        for k in 0..count {
            upstream[k] = d_pos[k];
            upstream[count + k] = -d_pos[k];
        }

        model.backward_pairs(&all_users, &all_items, &upstream, self.optimizer.as_mut())?;
        Ok(Some(loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::TwoTowerModel;
    use crate::config::Config;
    use nalgebra::DMatrix;

    fn training_config(loss_mode: LossMode, negatives: usize) -> TrainingConfig {
        let mut cfg = Config::default().training;
        cfg.loss_mode = loss_mode;
        cfg.negative_samples_per_positive = negatives;
        cfg.epochs = 1;
        cfg.batch_size = 4;
        cfg
    }

    fn batch(users: Vec<usize>, positives: Vec<usize>) -> LossBatch {
        LossBatch {
            users,
            positives,
            negatives: Vec::new(),
            negatives_per_positive: 0,
        }
    }

    #[test]
    fn test_softmax_loss_is_finite_and_nonnegative() {
        let mut model = TwoTowerModel::new(4, 4, 8, 1);
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));
        let loss = trainer
            .step_batch(&mut model, &batch(vec![0, 1, 2], vec![0, 1, 2]), 0, 0)
            .unwrap()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_pairwise_loss_is_finite_and_nonnegative() {
        let mut model = TwoTowerModel::new(4, 4, 8, 1);
        let mut trainer = Trainer::new(&training_config(LossMode::Pairwise, 2));
        let b = LossBatch {
            users: vec![0, 1],
            positives: vec![0, 1],
            negatives: vec![2, 3, 1, 0],
            negatives_per_positive: 2,
        };
        let loss = trainer.step_batch(&mut model, &b, 0, 0).unwrap().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_single_pair_softmax_batch_skipped() {
        let mut model = TwoTowerModel::new(2, 2, 4, 1);
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));
        let outcome = trainer
            .step_batch(&mut model, &batch(vec![0], vec![1]), 0, 0)
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_mismatched_batch_fails_fast() {
        let mut model = TwoTowerModel::new(2, 2, 4, 1);
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));
        let bad = batch(vec![0, 1], vec![0]);
        assert!(matches!(
            trainer.step_batch(&mut model, &bad, 0, 0).unwrap_err(),
            RecError::BatchShape { .. }
        ));
    }

    /// A model whose scores are poisoned; training must stop, not continue.
    struct NanModel;

    impl RetrievalModel for NanModel {
        fn num_users(&self) -> usize {
            4
        }
        fn num_items(&self) -> usize {
            4
        }
        fn embedding_dim(&self) -> usize {
            2
        }
        fn embed_users(&self, indices: &[usize]) -> crate::error::Result<DMatrix<f32>> {
            Ok(DMatrix::from_element(indices.len(), 2, f32::NAN))
        }
        fn embed_items(&self, indices: &[usize]) -> crate::error::Result<DMatrix<f32>> {
            Ok(DMatrix::from_element(indices.len(), 2, f32::NAN))
        }
        fn score_pairs(&self, users: &[usize], _: &[usize]) -> crate::error::Result<DVector<f32>> {
            Ok(DVector::from_element(users.len(), f32::NAN))
        }
        fn score_matrix(
            &self,
            users: &[usize],
            items: &[usize],
        ) -> crate::error::Result<DMatrix<f32>> {
            Ok(DMatrix::from_element(users.len(), items.len(), f32::NAN))
        }
        fn score_user(&self, _: usize, items: &[usize]) -> crate::error::Result<DVector<f32>> {
            Ok(DVector::from_element(items.len(), f32::NAN))
        }
        fn backward_pairs(
            &mut self,
            _: &[usize],
            _: &[usize],
            _: &DVector<f32>,
            _: &mut dyn Optimizer,
        ) -> crate::error::Result<()> {
            panic!("diverged batch must not reach backward");
        }
        fn backward_matrix(
            &mut self,
            _: &[usize],
            _: &[usize],
            _: &DMatrix<f32>,
            _: &mut dyn Optimizer,
        ) -> crate::error::Result<()> {
            panic!("diverged batch must not reach backward");
        }
    }

    #[test]
    fn test_non_finite_loss_aborts_with_context() {
        let mut model = NanModel;
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));
        let err = trainer
            .step_batch(&mut model, &batch(vec![0, 1], vec![0, 1]), 3, 7)
            .unwrap_err();
        match err {
            RecError::Divergence { epoch, batch, .. } => {
                assert_eq!(epoch, 3);
                assert_eq!(batch, 7);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_checked_at_batch_boundary() {
        let mut model = TwoTowerModel::new(4, 4, 4, 1);
        let pairs: Vec<_> = (0..4)
            .map(|i| crate::models::TrainingPair { user: i, item: i })
            .collect();
        let mut sampler = BatchSampler::new(pairs, 2, 0, 4, 1).unwrap();
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = trainer.run(&mut model, &mut sampler, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.batches_run, 0);
    }

    #[tokio::test]
    async fn test_loss_history_tracks_batches() {
        let mut model = TwoTowerModel::new(3, 4, 4, 1);
        let pairs: Vec<_> = (0..6)
            .map(|i| crate::models::TrainingPair {
                user: i % 3,
                item: i % 4,
            })
            .collect();
        let mut sampler = BatchSampler::new(pairs, 4, 0, 4, 1).unwrap();
        let mut trainer = Trainer::new(&training_config(LossMode::InBatchSoftmax, 0));

        let report = trainer
            .run(&mut model, &mut sampler, &CancelToken::new())
            .await
            .unwrap();
        // 6 pairs at batch size 4: one full batch and one of 2, none skipped.
        assert_eq!(report.batches_run, 2);
        assert_eq!(report.loss_history.len(), 2);
        assert_eq!(report.skipped_batches, 0);
        assert_eq!(report.epochs_run, 1);
    }

    #[tokio::test]
    async fn test_training_reduces_softmax_loss() {
        let mut model = TwoTowerModel::new(3, 4, 8, 1);
        let pairs: Vec<_> = (0..6)
            .map(|i| crate::models::TrainingPair {
                user: i % 3,
                item: i % 4,
            })
            .collect();
        let mut sampler = BatchSampler::new(pairs, 6, 0, 4, 1).unwrap();
        let mut cfg = training_config(LossMode::InBatchSoftmax, 0);
        cfg.epochs = 30;
        cfg.batch_size = 6;
        let mut trainer = Trainer::new(&cfg);

        let report = trainer
            .run(&mut model, &mut sampler, &CancelToken::new())
            .await
            .unwrap();
        let first = report.loss_history.first().copied().unwrap();
        let last = report.loss_history.last().copied().unwrap();
        assert!(
            last < first,
            "loss should trend down: first {first}, last {last}"
        );
    }
}
