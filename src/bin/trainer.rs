use anyhow::Result;
use chrono::DateTime;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use towerec::data::{fetch_records, FileSource};
use towerec::services::training::CancelToken;
use towerec::utils::metrics::{leave_latest_split, MetricsCalculator};
use towerec::{init_tracing, Config, Session};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the configured data directory.
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Override the configured epoch count.
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Skip the held-out evaluation pass.
    #[arg(long)]
    no_eval: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    info!("starting towerec offline trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("config file not found, using default configuration");
        Config::default()
    };
    if let Some(data_dir) = args.data_dir {
        config.data.data_dir = data_dir;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    info!("trainer configuration loaded: {:?}", config.training);

    let source = FileSource::new(&config.data.data_dir);
    let (interactions, items) = fetch_records(
        &source,
        &config.data.interactions_file,
        &config.data.items_file,
    )
    .await?;

    let (train_records, holdout) = if args.no_eval {
        (interactions, Vec::new())
    } else {
        leave_latest_split(&interactions)
    };
    info!(
        "{} training interactions, {} held out for evaluation",
        train_records.len(),
        holdout.len()
    );

    let top_k = config.recommendation.top_k;
    let min_ratings = config.recommendation.min_ratings_for_eligible_test_user;
    let seed = config.data.seed;

    let mut session = Session::from_records(config, train_records, items)?;
    let report = session.train(&CancelToken::new()).await?;
    info!(
        "training complete: {} epochs, {} batches ({} skipped), final loss {:?}",
        report.epochs_run,
        report.batches_run,
        report.skipped_batches,
        report.final_loss()
    );

    if !holdout.is_empty() {
        evaluate_holdout(&session, &holdout, top_k)?;
    }

    print_demo_user(&session, min_ratings, top_k, seed)?;

    Ok(())
}

/// Score each held-out (user, item) against the trained model: did the item
/// the user actually picked next make the top-k?
fn evaluate_holdout(
    session: &Session,
    holdout: &[towerec::RawInteraction],
    top_k: usize,
) -> Result<()> {
    let store = session.store();
    let recommender = session.recommender()?;
    let calc = MetricsCalculator::new(top_k);

    let mut evaluated = 0usize;
    let mut hits = 0usize;
    let mut precision_sum = 0.0f64;
    let mut recall_sum = 0.0f64;

    for record in holdout {
        // Held-out items that never made it into the catalog can't be scored.
        let (Some(user), Some(target)) = (
            store.user_index().to_dense(record.user_id),
            store.item_index().to_dense(record.item_id),
        ) else {
            continue;
        };

        let recommended: Vec<usize> = recommender
            .recommend_unseen(user, top_k)?
            .iter()
            .map(|r| r.item)
            .collect();

        evaluated += 1;
        if calc.hit_at_k(&recommended, target) {
            hits += 1;
        }
        precision_sum += calc.precision_at_k(&recommended, &[target]);
        recall_sum += calc.recall_at_k(&recommended, &[target]);
    }

    if evaluated > 0 {
        info!(
            "holdout evaluation over {evaluated} users: hit-rate@{top_k} {:.4}, precision@{top_k} {:.4}, recall@{top_k} {:.4}",
            hits as f64 / evaluated as f64,
            precision_sum / evaluated as f64,
            recall_sum / evaluated as f64,
        );
    } else {
        info!("no held-out interactions were scorable");
    }
    Ok(())
}

fn print_demo_user(session: &Session, min_ratings: usize, top_k: usize, seed: u64) -> Result<()> {
    let store = session.store();
    let recommender = session.recommender()?;
    let mut rng = StdRng::seed_from_u64(seed);

    let Some(user) = recommender.sample_eligible_user(min_ratings, &mut rng) else {
        info!("no user has at least {min_ratings} ratings; skipping the demo printout");
        return Ok(());
    };
    let external = store.user_index().to_external(user).unwrap_or_default();

    println!("\n=== demo user {external} ===");
    println!("-- best-rated history --");
    for entry in recommender.top_rated_history(user, 5)? {
        let date = DateTime::from_timestamp(entry.timestamp, 0)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!("  {}/5  {}  ({date})", entry.rating, entry.title);
    }

    println!("-- top {top_k} recommendations --");
    for rec in recommender.recommend_unseen(user, top_k)? {
        println!("  {:>7.3}  {}", rec.score, rec.title);
    }

    Ok(())
}
