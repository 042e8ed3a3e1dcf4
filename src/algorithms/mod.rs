pub mod initializer;
pub mod mlp;
pub mod optimizer;

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ModelConfig;
use crate::data::InteractionStore;
use crate::error::{RecError, Result};
use mlp::{Mlp, MlpGrads};
use optimizer::{Optimizer, ParamKey};

/// The trainable embedding capability the pipeline runs against.
///
/// Two variants exist: a bilinear two-tower model scoring with a plain dot
/// product, and a deep variant that adds a small feed-forward correction on
/// top of the same dot product. Scoring never mutates; the `backward_*`
/// methods accumulate gradients for the given upstream signal and take
/// exactly one optimizer step.
pub trait RetrievalModel: Send + Sync {
    fn num_users(&self) -> usize;
    fn num_items(&self) -> usize;
    fn embedding_dim(&self) -> usize;

    /// Stack user embedding rows, one per index.
    fn embed_users(&self, indices: &[usize]) -> Result<DMatrix<f32>>;
    /// Stack item embedding rows, one per index.
    fn embed_items(&self, indices: &[usize]) -> Result<DMatrix<f32>>;

    /// Score parallel (user, item) pairs.
    fn score_pairs(&self, users: &[usize], items: &[usize]) -> Result<DVector<f32>>;
    /// Score every user row against every item column.
    fn score_matrix(&self, users: &[usize], items: &[usize]) -> Result<DMatrix<f32>>;
    /// Score one user against a slice of items; the user embedding is looked
    /// up once for the whole slice.
    fn score_user(&self, user: usize, items: &[usize]) -> Result<DVector<f32>>;

    /// Apply `dLoss/dScore` for parallel pairs. Duplicate indices accumulate
    /// before the step.
    fn backward_pairs(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DVector<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()>;

    /// Apply `dLoss/dScore` for a full score matrix.
    fn backward_matrix(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DMatrix<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()>;
}

/// Construct the configured model variant for a loaded store. Same config,
/// store and seed always yield identical initial parameters.
pub fn build_model(
    cfg: &ModelConfig,
    store: &InteractionStore,
    seed: u64,
) -> Result<Box<dyn RetrievalModel>> {
    if cfg.use_deep_features {
        let item_genres = cfg.use_item_genres.then(|| store.genre_matrix());
        let user_aux = cfg.use_user_aux_features.then(|| store.user_aux());
        Ok(Box::new(DeepTwoTowerModel::new(
            store.num_users(),
            store.num_items(),
            cfg.embedding_dim,
            cfg.hidden_dim,
            item_genres,
            user_aux,
            seed,
        )?))
    } else {
        Ok(Box::new(TwoTowerModel::new(
            store.num_users(),
            store.num_items(),
            cfg.embedding_dim,
            seed,
        )))
    }
}

/// Bilinear two-tower model: score(u, i) = e_u . e_i.
pub struct TwoTowerModel {
    users: Vec<DVector<f32>>,
    items: Vec<DVector<f32>>,
    dim: usize,
}

impl TwoTowerModel {
    pub fn new(num_users: usize, num_items: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let users = (0..num_users)
            .map(|_| initializer::xavier_uniform(dim, &mut rng))
            .collect();
        let items = (0..num_items)
            .map(|_| initializer::xavier_uniform(dim, &mut rng))
            .collect();
        Self { users, items, dim }
    }

    fn user_row(&self, user: usize) -> Result<&DVector<f32>> {
        self.users.get(user).ok_or(RecError::UnknownUser(user))
    }

    fn item_row(&self, item: usize) -> Result<&DVector<f32>> {
        self.items.get(item).ok_or(RecError::UnknownItem(item))
    }

    fn stack_users(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        let mut out = DMatrix::zeros(indices.len(), self.dim);
        for (row, &user) in indices.iter().enumerate() {
            out.row_mut(row).copy_from(&self.user_row(user)?.transpose());
        }
        Ok(out)
    }

    fn stack_items(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        let mut out = DMatrix::zeros(indices.len(), self.dim);
        for (row, &item) in indices.iter().enumerate() {
            out.row_mut(row).copy_from(&self.item_row(item)?.transpose());
        }
        Ok(out)
    }

    /// Scatter-add dense gradient rows into per-index accumulators and step.
    fn step_embeddings(
        &mut self,
        user_indices: &[usize],
        item_indices: &[usize],
        d_users: &DMatrix<f32>,
        d_items: &DMatrix<f32>,
        opt: &mut dyn Optimizer,
    ) {
        let mut user_grads: HashMap<usize, DVector<f32>> = HashMap::new();
        for (row, &user) in user_indices.iter().enumerate() {
            let acc = user_grads
                .entry(user)
                .or_insert_with(|| DVector::zeros(self.dim));
            *acc += d_users.row(row).transpose();
        }
        let mut item_grads: HashMap<usize, DVector<f32>> = HashMap::new();
        for (row, &item) in item_indices.iter().enumerate() {
            let acc = item_grads
                .entry(item)
                .or_insert_with(|| DVector::zeros(self.dim));
            *acc += d_items.row(row).transpose();
        }

        for (user, grad) in user_grads {
            opt.update(
                ParamKey::UserEmbedding(user),
                self.users[user].as_mut_slice(),
                grad.as_slice(),
            );
        }
        for (item, grad) in item_grads {
            opt.update(
                ParamKey::ItemEmbedding(item),
                self.items[item].as_mut_slice(),
                grad.as_slice(),
            );
        }
    }
}

fn check_parallel(context: &'static str, left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(RecError::BatchShape {
            context,
            left,
            right,
        });
    }
    Ok(())
}

impl RetrievalModel for TwoTowerModel {
    fn num_users(&self) -> usize {
        self.users.len()
    }

    fn num_items(&self) -> usize {
        self.items.len()
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn embed_users(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        self.stack_users(indices)
    }

    fn embed_items(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        self.stack_items(indices)
    }

    fn score_pairs(&self, users: &[usize], items: &[usize]) -> Result<DVector<f32>> {
        check_parallel("score pairs", users.len(), items.len())?;
        let mut out = DVector::zeros(users.len());
        for (k, (&user, &item)) in users.iter().zip(items).enumerate() {
            out[k] = self.user_row(user)?.dot(self.item_row(item)?);
        }
        Ok(out)
    }

    fn score_matrix(&self, users: &[usize], items: &[usize]) -> Result<DMatrix<f32>> {
        let u = self.stack_users(users)?;
        let p = self.stack_items(items)?;
        Ok(&u * p.transpose())
    }

    fn score_user(&self, user: usize, items: &[usize]) -> Result<DVector<f32>> {
        let u = self.user_row(user)?.clone();
        let mut out = DVector::zeros(items.len());
        for (k, &item) in items.iter().enumerate() {
            out[k] = u.dot(self.item_row(item)?);
        }
        Ok(out)
    }

    fn backward_pairs(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DVector<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()> {
        check_parallel("backward pairs", users.len(), items.len())?;
        check_parallel("backward upstream", users.len(), upstream.len())?;

        // d(u.i)/du = i, d(u.i)/di = u; read weights before any update.
        let mut d_users = DMatrix::zeros(users.len(), self.dim);
        let mut d_items = DMatrix::zeros(items.len(), self.dim);
        for k in 0..users.len() {
            let g = upstream[k];
            d_users
                .row_mut(k)
                .copy_from(&(self.item_row(items[k])?.transpose() * g));
            d_items
                .row_mut(k)
                .copy_from(&(self.user_row(users[k])?.transpose() * g));
        }
        self.step_embeddings(users, items, &d_users, &d_items, opt);
        Ok(())
    }

    fn backward_matrix(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DMatrix<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()> {
        check_parallel("backward matrix rows", upstream.nrows(), users.len())?;
        check_parallel("backward matrix cols", upstream.ncols(), items.len())?;

        let u = self.stack_users(users)?;
        let p = self.stack_items(items)?;
        let d_users = upstream * &p;
        let d_items = upstream.transpose() * &u;
        self.step_embeddings(users, items, &d_users, &d_items, opt);
        Ok(())
    }
}

/// Two-tower model with a residual feed-forward correction:
/// score(u, i) = e_u . e_i + mlp([e_u, e_i, genres_i?, aux_u?]).
///
/// The dot product stays the primary retrieval signal; the network output is
/// added to it, never substituted.
pub struct DeepTwoTowerModel {
    towers: TwoTowerModel,
    mlp: Mlp,
    item_genres: Option<Arc<DMatrix<f32>>>,
    user_aux: Option<Arc<DMatrix<f32>>>,
}

impl std::fmt::Debug for DeepTwoTowerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepTwoTowerModel").finish_non_exhaustive()
    }
}

impl DeepTwoTowerModel {
    pub fn new(
        num_users: usize,
        num_items: usize,
        dim: usize,
        hidden_dim: usize,
        item_genres: Option<Arc<DMatrix<f32>>>,
        user_aux: Option<Arc<DMatrix<f32>>>,
        seed: u64,
    ) -> Result<Self> {
        if let Some(genres) = &item_genres {
            check_parallel("genre matrix rows", genres.nrows(), num_items)?;
        }
        if let Some(aux) = &user_aux {
            check_parallel("user aux rows", aux.nrows(), num_users)?;
        }

        let towers = TwoTowerModel::new(num_users, num_items, dim, seed);
        let input_dim = 2 * dim
            + item_genres.as_ref().map_or(0, |m| m.ncols())
            + user_aux.as_ref().map_or(0, |m| m.ncols());
        // Separate seed stream for the dense weights so toggling the deep
        // path never changes the tower init.
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        let mlp = Mlp::new(input_dim, hidden_dim, &mut rng);

        Ok(Self {
            towers,
            mlp,
            item_genres,
            user_aux,
        })
    }

    fn feature_input(&self, user: usize, item: usize) -> Result<DVector<f32>> {
        let u = self.towers.user_row(user)?;
        let i = self.towers.item_row(item)?;
        let mut x = Vec::with_capacity(self.mlp.input_dim());
        x.extend(u.iter().copied());
        x.extend(i.iter().copied());
        if let Some(genres) = &self.item_genres {
            x.extend(genres.row(item).iter().copied());
        }
        if let Some(aux) = &self.user_aux {
            x.extend(aux.row(user).iter().copied());
        }
        Ok(DVector::from_vec(x))
    }

    fn pair_score(&self, user: usize, item: usize) -> Result<f32> {
        let dot = self.towers.user_row(user)?.dot(self.towers.item_row(item)?);
        Ok(dot + self.mlp.forward(&self.feature_input(user, item)?))
    }

    /// Backprop one scored pair into the shared accumulators. The first
    /// `dim` entries of the MLP input gradient belong to the user embedding,
    /// the next `dim` to the item embedding; feature segments are constants.
    fn accumulate_pair(
        &self,
        user: usize,
        item: usize,
        g: f32,
        user_grads: &mut HashMap<usize, DVector<f32>>,
        item_grads: &mut HashMap<usize, DVector<f32>>,
        mlp_grads: &mut MlpGrads,
    ) -> Result<()> {
        let dim = self.towers.dim;
        let u = self.towers.user_row(user)?.clone();
        let i = self.towers.item_row(item)?.clone();

        let x = self.feature_input(user, item)?;
        let dx = self.mlp.backward(&x, g, mlp_grads);

        let du = user_grads
            .entry(user)
            .or_insert_with(|| DVector::zeros(dim));
        *du += i * g + dx.rows(0, dim).clone_owned();

        let di = item_grads
            .entry(item)
            .or_insert_with(|| DVector::zeros(dim));
        *di += u * g + dx.rows(dim, dim).clone_owned();
        Ok(())
    }

    fn step(
        &mut self,
        user_grads: HashMap<usize, DVector<f32>>,
        item_grads: HashMap<usize, DVector<f32>>,
        mlp_grads: MlpGrads,
        opt: &mut dyn Optimizer,
    ) {
        for (user, grad) in user_grads {
            opt.update(
                ParamKey::UserEmbedding(user),
                self.towers.users[user].as_mut_slice(),
                grad.as_slice(),
            );
        }
        for (item, grad) in item_grads {
            opt.update(
                ParamKey::ItemEmbedding(item),
                self.towers.items[item].as_mut_slice(),
                grad.as_slice(),
            );
        }
        self.mlp.apply(&mlp_grads, opt);
    }
}

impl RetrievalModel for DeepTwoTowerModel {
    fn num_users(&self) -> usize {
        self.towers.num_users()
    }

    fn num_items(&self) -> usize {
        self.towers.num_items()
    }

    fn embedding_dim(&self) -> usize {
        self.towers.embedding_dim()
    }

    fn embed_users(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        self.towers.embed_users(indices)
    }

    fn embed_items(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        self.towers.embed_items(indices)
    }

    fn score_pairs(&self, users: &[usize], items: &[usize]) -> Result<DVector<f32>> {
        check_parallel("score pairs", users.len(), items.len())?;
        let mut out = DVector::zeros(users.len());
        for (k, (&user, &item)) in users.iter().zip(items).enumerate() {
            out[k] = self.pair_score(user, item)?;
        }
        Ok(out)
    }

    fn score_matrix(&self, users: &[usize], items: &[usize]) -> Result<DMatrix<f32>> {
        let mut out = self.towers.score_matrix(users, items)?;
        for (row, &user) in users.iter().enumerate() {
            for (col, &item) in items.iter().enumerate() {
                out[(row, col)] += self.mlp.forward(&self.feature_input(user, item)?);
            }
        }
        Ok(out)
    }

    fn score_user(&self, user: usize, items: &[usize]) -> Result<DVector<f32>> {
        let mut out = self.towers.score_user(user, items)?;
        for (k, &item) in items.iter().enumerate() {
            out[k] += self.mlp.forward(&self.feature_input(user, item)?);
        }
        Ok(out)
    }

    fn backward_pairs(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DVector<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()> {
        check_parallel("backward pairs", users.len(), items.len())?;
        check_parallel("backward upstream", users.len(), upstream.len())?;

        let mut user_grads = HashMap::new();
        let mut item_grads = HashMap::new();
        let mut mlp_grads = MlpGrads::zeros(self.mlp.input_dim(), self.mlp.hidden_dim());
        for k in 0..users.len() {
            self.accumulate_pair(
                users[k],
                items[k],
                upstream[k],
                &mut user_grads,
                &mut item_grads,
                &mut mlp_grads,
            )?;
        }
        self.step(user_grads, item_grads, mlp_grads, opt);
        Ok(())
    }

    fn backward_matrix(
        &mut self,
        users: &[usize],
        items: &[usize],
        upstream: &DMatrix<f32>,
        opt: &mut dyn Optimizer,
    ) -> Result<()> {
        check_parallel("backward matrix rows", upstream.nrows(), users.len())?;
        check_parallel("backward matrix cols", upstream.ncols(), items.len())?;

        let mut user_grads = HashMap::new();
        let mut item_grads = HashMap::new();
        let mut mlp_grads = MlpGrads::zeros(self.mlp.input_dim(), self.mlp.hidden_dim());
        for (row, &user) in users.iter().enumerate() {
            for (col, &item) in items.iter().enumerate() {
                self.accumulate_pair(
                    user,
                    item,
                    upstream[(row, col)],
                    &mut user_grads,
                    &mut item_grads,
                    &mut mlp_grads,
                )?;
            }
        }
        self.step(user_grads, item_grads, mlp_grads, opt);
        Ok(())
    }
}
