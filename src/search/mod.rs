//! Search service: a derived, event-driven projection of posts.
//!
//! The index is written only by [`SearchProjector`]; the HTTP side reads it
//! through a cache keyed by the exact query string.

mod index;
mod projector;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use tracing::instrument;

pub use self::index::{InMemorySearchIndex, MAX_RESULTS, PgSearchIndex, SearchIndex};
pub use self::projector::SearchProjector;

use crate::cache::{self, Cache, keys};
use crate::config::Config;
use crate::error::AppResult;
use crate::event_bus::EventBus;
use crate::extract::TrustedUser;
use crate::handlers::health_report;
use crate::models::{ApiResponse, HealthResponse, SearchDocument, SearchPayload, SearchQuery};
use crate::routes::with_common_layers;
use crate::validation::validate_search_query;

#[derive(Clone)]
pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
    bus: Arc<dyn EventBus>,
    cache_ttl: Duration,
}

impl SearchService {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        cache: Arc<dyn Cache>,
        bus: Arc<dyn EventBus>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            index,
            cache,
            bus,
            cache_ttl,
        }
    }

    /// Projector sharing this service's index and cache.
    pub fn projector(&self) -> SearchProjector {
        SearchProjector::new(self.index.clone(), self.cache.clone())
    }

    #[instrument(skip(self))]
    pub async fn search(&self, query: Option<&str>) -> AppResult<Vec<SearchDocument>> {
        let query = validate_search_query(query)?;
        let key = keys::search(&query);

        if let Some(hits) = cache::get_json::<Vec<SearchDocument>>(self.cache.as_ref(), &key).await
        {
            return Ok(hits);
        }

        let hits = self.index.search(&query, MAX_RESULTS).await?;
        cache::put_json(self.cache.as_ref(), &key, &hits, self.cache_ttl).await;
        Ok(hits)
    }
}

pub fn build_search_router(service: SearchService, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/search/search-posts", get(search_posts))
        .with_state(service);

    with_common_layers(router, config)
}

#[instrument(skip(service))]
async fn search_posts(
    State(service): State<SearchService>,
    TrustedUser(_user_id): TrustedUser,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<ApiResponse<SearchPayload>>> {
    let data = service.search(query.query.as_deref()).await?;
    Ok(Json(ApiResponse::ok(
        "Search results fetched successfully",
        SearchPayload { data },
    )))
}

async fn health(State(service): State<SearchService>) -> Json<HealthResponse> {
    health_report(
        "search",
        &[
            ("database", service.index.ping().await),
            ("cache", service.cache.ping().await),
            ("event_bus", service.bus.is_connected()),
        ],
    )
}
