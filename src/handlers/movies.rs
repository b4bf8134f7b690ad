use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    handlers::common::{created_response, success_response, validate_input},
    services::catalog::CreateMovieInput,
    AppState, ListQuery, PaginatedResponse,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

/// Creates the router for catalog endpoints
pub fn movies_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_movies).post(create_movie))
        .route("/:id", get(get_movie))
        .route("/:id/availability", put(set_availability))
}

/// List available movies
async fn list_movies(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let per_page = query.limit.clamp(1, 100);
    let (movies, total) = state
        .services
        .catalog
        .list_movies(query.page.max(1), per_page)
        .await?;

    let total_pages = total.div_ceil(per_page);
    Ok(success_response(PaginatedResponse {
        items: movies,
        total,
        page: query.page.max(1),
        limit: per_page,
        total_pages,
    }))
}

/// Fetch a single movie
async fn get_movie(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let movie = state.services.catalog.get_movie(id).await?;
    Ok(success_response(movie))
}

/// Stock a new movie (admin)
async fn create_movie(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateMovieInput>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_admin()
        .map_err(|_| ServiceError::Forbidden("Admin role required".to_string()))?;
    validate_input(&payload)?;

    let movie = state.services.catalog.create_movie(payload).await?;
    Ok(created_response(movie))
}

#[derive(Debug, Deserialize)]
struct AvailabilityRequest {
    available: bool,
}

/// Toggle a movie's availability (admin)
async fn set_availability(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_admin()
        .map_err(|_| ServiceError::Forbidden("Admin role required".to_string()))?;

    let movie = state
        .services
        .catalog
        .set_availability(id, payload.available)
        .await?;
    Ok(success_response(movie))
}
