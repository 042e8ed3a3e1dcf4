pub mod algorithms;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod sampler;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{RecError, Result};
pub use models::*;

use std::sync::Arc;

use crate::algorithms::{build_model, RetrievalModel};
use crate::data::{fetch_records, DataSource, InteractionStore};
use crate::sampler::BatchSampler;
use crate::services::recommendation::Recommender;
use crate::services::training::{CancelToken, Trainer};

/// One load/train/serve cycle: the store, its index spaces, and the model
/// trained against them, owned together.
///
/// The pairing is the point: embeddings are only meaningful for the index
/// space they were trained on, so a new store always comes with a freshly
/// initialized model and there is no way to mix generations.
pub struct Session {
    config: Arc<Config>,
    store: Arc<InteractionStore>,
    model: Box<dyn RetrievalModel>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Fetch, parse, and index records through a data source.
    pub async fn load(config: Config, source: &dyn DataSource) -> Result<Self> {
        let (interactions, items) = fetch_records(
            source,
            &config.data.interactions_file,
            &config.data.items_file,
        )
        .await?;
        Self::from_records(config, interactions, items)
    }

    /// Build a session from already-parsed records.
    pub fn from_records(
        config: Config,
        interactions: Vec<RawInteraction>,
        items: Vec<ItemMetadata>,
    ) -> Result<Self> {
        let store = InteractionStore::load(
            interactions,
            items,
            config.data.max_interactions,
            config.data.seed,
        )?;
        let model = build_model(&config.model, &store, config.data.seed)?;
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            model,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &InteractionStore {
        &self.store
    }

    pub fn model(&self) -> &dyn RetrievalModel {
        self.model.as_ref()
    }

    /// Discard trained parameters and reinitialize from the session seed.
    pub fn rebuild_model(&mut self) -> Result<()> {
        self.model = build_model(&self.config.model, &self.store, self.config.data.seed)?;
        Ok(())
    }

    /// Run the configured number of epochs against this session's model.
    pub async fn train(&mut self, cancel: &CancelToken) -> Result<TrainReport> {
        let mut sampler = BatchSampler::new(
            self.store.pairs().to_vec(),
            self.config.training.batch_size,
            self.config.training.negative_samples_per_positive,
            self.store.num_items(),
            self.config.data.seed,
        )?;
        let mut trainer = Trainer::new(&self.config.training);
        trainer.run(self.model.as_mut(), &mut sampler, cancel).await
    }

    pub fn recommender(&self) -> Result<Recommender<'_>> {
        Recommender::new(
            &self.store,
            self.model.as_ref(),
            self.config.recommendation.score_chunk_size,
        )
    }
}

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
