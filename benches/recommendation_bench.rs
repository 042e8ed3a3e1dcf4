use criterion::{black_box, criterion_group, criterion_main, Criterion};

use towerec::config::LossMode;
use towerec::models::{ItemMetadata, RawInteraction, GENRE_DIM};
use towerec::services::training::CancelToken;
use towerec::{Config, Session};

fn synthetic_session(num_users: u32, num_items: u32, loss_mode: LossMode) -> Session {
    let mut interactions = Vec::new();
    for user in 0..num_users {
        for slot in 0..20u32 {
            let item = (user * 7 + slot * 13) % num_items;
            interactions.push(RawInteraction {
                user_id: user + 1,
                item_id: item + 1,
                rating: 1 + ((user + slot) % 5) as u8,
                timestamp: 800_000_000 + (user * 20 + slot) as i64,
            });
        }
    }
    let items = (0..num_items)
        .map(|item| {
            let mut genres = [0u8; GENRE_DIM];
            genres[(item as usize) % GENRE_DIM] = 1;
            ItemMetadata {
                item_id: item + 1,
                title: format!("Item {}", item + 1),
                release_year: Some(1995),
                genres,
            }
        })
        .collect();

    let mut config = Config::default();
    config.model.embedding_dim = 32;
    config.training.epochs = 1;
    config.training.batch_size = 128;
    config.training.loss_mode = loss_mode;
    if loss_mode == LossMode::Pairwise {
        config.training.negative_samples_per_positive = 1;
    }

    Session::from_records(config, interactions, items).unwrap()
}

fn benchmark_catalog_scoring(c: &mut Criterion) {
    let session = synthetic_session(200, 1000, LossMode::InBatchSoftmax);
    let recommender = session.recommender().unwrap();

    c.bench_function("recommend_top10_full_catalog", |b| {
        b.iter(|| {
            let recs = recommender.recommend_unseen(black_box(0), 10).unwrap();
            black_box(recs);
        });
    });

    c.bench_function("similar_items_top10", |b| {
        b.iter(|| {
            let neighbors = recommender.similar_items(black_box(0), 10).unwrap();
            black_box(neighbors);
        });
    });
}

fn benchmark_training_epoch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("softmax_epoch_4k_pairs", |b| {
        b.iter(|| {
            let mut session = synthetic_session(200, 1000, LossMode::InBatchSoftmax);
            let report = rt
                .block_on(session.train(&CancelToken::new()))
                .unwrap();
            black_box(report);
        });
    });

    c.bench_function("pairwise_epoch_4k_pairs", |b| {
        b.iter(|| {
            let mut session = synthetic_session(200, 1000, LossMode::Pairwise);
            let report = rt
                .block_on(session.train(&CancelToken::new()))
                .unwrap();
            black_box(report);
        });
    });
}

criterion_group!(
    benches,
    benchmark_catalog_scoring,
    benchmark_training_epoch
);
criterion_main!(benches);
