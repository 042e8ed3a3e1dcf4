use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use towerec::data::FileSource;
use towerec::services::recommendation::RatedItem;
use towerec::services::training::CancelToken;
use towerec::{init_tracing, Config, RankedItem, RecError, Session, TrainReport};

#[derive(Clone)]
struct AppState {
    session: Arc<RwLock<Session>>,
    // Served lists keyed by (external user id, k); cleared on retrain.
    rec_cache: Arc<DashMap<(u32, usize), Vec<RankedItem>>>,
}

#[derive(Debug, Deserialize)]
struct TopKQuery {
    k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TrainQuery {
    /// Reinitialize parameters before training instead of continuing.
    fresh: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: String,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecommendationResponse {
    user_id: u32,
    recommendations: Vec<RankedItem>,
    generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    user_id: u32,
    history: Vec<RatedItem>,
}

#[derive(Debug, Serialize)]
struct ItemResponse {
    item_id: u32,
    title: String,
    release_year: Option<u16>,
}

#[derive(Debug, Serialize)]
struct SimilarItemsResponse {
    item_id: u32,
    neighbors: Vec<RankedItem>,
}

fn status_for(err: &RecError) -> StatusCode {
    match err {
        RecError::UnknownUser(_) | RecError::UnknownItem(_) => StatusCode::NOT_FOUND,
        RecError::DataSource { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_check() -> Json<ApiResponse<HashMap<String, String>>> {
    let mut status = HashMap::new();
    status.insert("status".to_string(), "healthy".to_string());
    status.insert("service".to_string(), "towerec".to_string());
    status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

    Json(ApiResponse::success(status))
}

async fn get_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<u32>,
    Query(params): Query<TopKQuery>,
) -> Result<Json<ApiResponse<RecommendationResponse>>, StatusCode> {
    let session = state.session.read().await;
    let k = params.k.unwrap_or(session.config().recommendation.top_k);

    let recommendations = if let Some(cached) = state.rec_cache.get(&(user_id, k)) {
        cached.clone()
    } else {
        let user = session
            .store()
            .user_index()
            .to_dense(user_id)
            .ok_or(StatusCode::NOT_FOUND)?;
        let fresh = session
            .recommender()
            .and_then(|rec| rec.recommend_unseen(user, k))
            .map_err(|e| {
                tracing::error!("failed to recommend for user {user_id}: {e}");
                status_for(&e)
            })?;
        state.rec_cache.insert((user_id, k), fresh.clone());
        fresh
    };

    Ok(Json(ApiResponse::success(RecommendationResponse {
        user_id,
        recommendations,
        generated_at: Utc::now(),
    })))
}

async fn get_user_history(
    State(state): State<AppState>,
    Path(user_id): Path<u32>,
    Query(params): Query<TopKQuery>,
) -> Result<Json<ApiResponse<HistoryResponse>>, StatusCode> {
    let session = state.session.read().await;
    let k = params.k.unwrap_or(session.config().recommendation.top_k);

    let user = session
        .store()
        .user_index()
        .to_dense(user_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let history = session
        .recommender()
        .and_then(|rec| rec.top_rated_history(user, k))
        .map_err(|e| {
            tracing::error!("failed to fetch history for user {user_id}: {e}");
            status_for(&e)
        })?;

    Ok(Json(ApiResponse::success(HistoryResponse {
        user_id,
        history,
    })))
}

async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<u32>,
) -> Result<Json<ApiResponse<ItemResponse>>, StatusCode> {
    let session = state.session.read().await;
    let item = session
        .store()
        .item_index()
        .to_dense(item_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let title = session
        .store()
        .title(item)
        .map_err(|e| status_for(&e))?
        .to_string();
    let release_year = session
        .store()
        .release_year(item)
        .map_err(|e| status_for(&e))?;

    Ok(Json(ApiResponse::success(ItemResponse {
        item_id,
        title,
        release_year,
    })))
}

async fn get_similar_items(
    State(state): State<AppState>,
    Path(item_id): Path<u32>,
    Query(params): Query<TopKQuery>,
) -> Result<Json<ApiResponse<SimilarItemsResponse>>, StatusCode> {
    let session = state.session.read().await;
    let k = params.k.unwrap_or(session.config().recommendation.top_k);

    let item = session
        .store()
        .item_index()
        .to_dense(item_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let neighbors = session
        .recommender()
        .and_then(|rec| rec.similar_items(item, k))
        .map_err(|e| {
            tracing::error!("failed to fetch neighbors for item {item_id}: {e}");
            status_for(&e)
        })?;

    Ok(Json(ApiResponse::success(SimilarItemsResponse {
        item_id,
        neighbors,
    })))
}

async fn train(
    State(state): State<AppState>,
    Query(params): Query<TrainQuery>,
) -> Result<Json<ApiResponse<TrainReport>>, StatusCode> {
    // The write lock keeps scoring out while parameters move.
    let mut session = state.session.write().await;

    if params.fresh.unwrap_or(false) {
        session.rebuild_model().map_err(|e| {
            tracing::error!("failed to rebuild model: {e}");
            status_for(&e)
        })?;
    }

    let report = session.train(&CancelToken::new()).await.map_err(|e| {
        tracing::error!("training failed: {e}");
        status_for(&e)
    })?;

    state.rec_cache.clear();
    info!(
        "training finished: {} batches, final loss {:?}",
        report.batches_run,
        report.final_loss()
    );
    Ok(Json(ApiResponse::success(report)))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/recommendations/:user_id", get(get_recommendations))
        .route("/users/:user_id/history", get(get_user_history))
        .route("/items/:item_id", get(get_item))
        .route("/items/:item_id/similar", get(get_similar_items))
        .route("/train", post(train))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().await;

    let config = if std::path::Path::new("config/default.toml").exists() {
        Config::from_file("config/default.toml")?
    } else {
        Config::default()
    };
    info!("starting towerec server with config: {:?}", config.server);

    let source = FileSource::new(&config.data.data_dir);
    let addr = config.server.socket_addr();
    let session = Session::load(config, &source).await?;
    info!(
        "session ready: {} users, {} items",
        session.store().num_users(),
        session.store().num_items()
    );

    let state = AppState {
        session: Arc::new(RwLock::new(session)),
        rec_cache: Arc::new(DashMap::new()),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
