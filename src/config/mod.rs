use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub recommendation: RecommendationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port).parse().unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_dir: String,
    pub interactions_file: String,
    pub items_file: String,
    /// Cap on interactions used for a run; excess is sampled away
    /// deterministically with `seed`.
    pub max_interactions: Option<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub use_deep_features: bool,
    pub use_item_genres: bool,
    pub use_user_aux_features: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    #[serde(rename = "in-batch-softmax")]
    InBatchSoftmax,
    #[serde(rename = "pairwise")]
    Pairwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub loss_mode: LossMode,
    /// Explicit negatives per positive pair; 0 relies on in-batch negatives
    /// (softmax mode) or the shifted-positive fallback (pairwise mode).
    pub negative_samples_per_positive: usize,
    pub optimizer: OptimizerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub top_k: usize,
    /// Items scored per chunk while sweeping the catalog.
    pub score_chunk_size: usize,
    pub min_ratings_for_eligible_test_user: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            data: DataConfig {
                data_dir: "data/ml-100k".to_string(),
                interactions_file: "u.data".to_string(),
                items_file: "u.item".to_string(),
                max_interactions: None,
                seed: 42,
            },
            model: ModelConfig {
                embedding_dim: 32,
                hidden_dim: 32,
                use_deep_features: false,
                use_item_genres: true,
                use_user_aux_features: false,
            },
            training: TrainingConfig {
                epochs: 5,
                batch_size: 256,
                learning_rate: 0.05,
                loss_mode: LossMode::InBatchSoftmax,
                negative_samples_per_positive: 0,
                optimizer: OptimizerKind::Sgd,
            },
            recommendation: RecommendationConfig {
                top_k: 10,
                score_chunk_size: 1024,
                min_ratings_for_eligible_test_user: 20,
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TOWEREC"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
