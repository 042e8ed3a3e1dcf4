use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use towerec::data::MemorySource;
use towerec::services::projection::{project_items, Reducer};
use towerec::services::training::CancelToken;
use towerec::{init_tracing, Config, Session};

/// Demo-grade dimensionality reducer: a fixed random projection to 2D.
struct RandomProjection {
    seed: u64,
}

impl Reducer for RandomProjection {
    fn reduce(
        &self,
        data: &DMatrix<f32>,
        target_dims: usize,
    ) -> towerec::Result<DMatrix<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let projection =
            DMatrix::from_fn(data.ncols(), target_dims, |_, _| rng.gen_range(-1.0..1.0));
        Ok(data * projection)
    }
}

/// Build a small synthetic catalog with two taste clusters: odd-numbered
/// users love low item ids, even-numbered users love high ones.
fn synthetic_dataset() -> (String, String) {
    let mut interactions = String::new();
    let mut timestamp = 880_000_000i64;
    for user in 1..=8u32 {
        for item in 1..=12u32 {
            let preferred = (user % 2 == 1) == (item <= 6);
            let rating = if preferred { 5 } else { 2 };
            // Preferred items dominate each user's log.
            if preferred || item % 3 == 0 {
                interactions.push_str(&format!("{user}\t{item}\t{rating}\t{timestamp}\n"));
                timestamp += 1000;
            }
        }
    }

    let mut items = String::new();
    for item in 1..=12u32 {
        let mut flags = ["0"; 19];
        flags[(item as usize) % 19] = "1";
        items.push_str(&format!(
            "{item}|Sample Film #{item} (199{})|01-Jan-199{}||http://example.org/{item}|{}\n",
            item % 10,
            item % 10,
            flags.join("|")
        ));
    }
    (interactions, items)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().await;

    let (interactions, items) = synthetic_dataset();
    let source = MemorySource::new()
        .with("u.data", &interactions)
        .with("u.item", &items);

    let mut config = Config::default();
    config.model.embedding_dim = 8;
    config.model.hidden_dim = 8;
    config.training.epochs = 40;
    config.training.batch_size = 16;

    println!("loading synthetic dataset...");
    let mut session = Session::load(config, &source).await?;
    println!(
        "  {} users, {} items, {} interactions",
        session.store().num_users(),
        session.store().num_items(),
        session.store().summary().interactions_kept
    );

    println!("training the bilinear tower model...");
    let report = session.train(&CancelToken::new()).await?;
    println!(
        "  {} batches, loss {:.4} -> {:.4}",
        report.batches_run,
        report.loss_history.first().copied().unwrap_or(0.0),
        report.final_loss().unwrap_or(0.0)
    );

    let recommender = session.recommender()?;
    let user = session.store().user_index().to_dense(1).expect("user 1 exists");
    println!("recommendations for user 1:");
    for rec in recommender.recommend_unseen(user, 5)? {
        println!("  {:>7.3}  {}", rec.score, rec.title);
    }

    println!("item embedding map (random 2D projection):");
    let points = project_items(
        session.model(),
        session.store(),
        &RandomProjection { seed: 7 },
    )?;
    for point in points {
        println!("  ({:>6.2}, {:>6.2})  {}", point.x, point.y, point.title);
    }

    // Same data, deep variant with genre and aux features in the MLP path.
    let (interactions, items) = synthetic_dataset();
    let source = MemorySource::new()
        .with("u.data", &interactions)
        .with("u.item", &items);
    let mut config = Config::default();
    config.model.embedding_dim = 8;
    config.model.hidden_dim = 16;
    config.model.use_deep_features = true;
    config.model.use_user_aux_features = true;
    config.training.epochs = 20;
    config.training.batch_size = 16;
    config.training.loss_mode = towerec::config::LossMode::Pairwise;
    config.training.negative_samples_per_positive = 2;

    println!("training the deep variant with pairwise loss...");
    let mut deep_session = Session::load(config, &source).await?;
    let report = deep_session.train(&CancelToken::new()).await?;
    println!(
        "  {} batches, final loss {:.4}",
        report.batches_run,
        report.final_loss().unwrap_or(0.0)
    );

    let recommender = deep_session.recommender()?;
    let user = deep_session
        .store()
        .user_index()
        .to_dense(2)
        .expect("user 2 exists");
    println!("deep-model recommendations for user 2:");
    for rec in recommender.recommend_unseen(user, 5)? {
        println!("  {:>7.3}  {}", rec.score, rec.title);
    }

    Ok(())
}
