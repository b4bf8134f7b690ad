use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    handlers::common::{no_content_response, success_response, validate_input},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for the authenticated user's cart
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item).delete(clear_cart))
        .route("/items/:movie_id", put(set_quantity).delete(remove_item))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub movie_id: Uuid,
    #[validate(range(min = 1))]
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetQuantityRequest {
    #[validate(range(min = 1))]
    pub quantity: i32,
}

/// Current cart contents priced at catalog prices
async fn get_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.services.cart.snapshot(user.user_id).await?;
    Ok(success_response(view))
}

/// Add a movie to the cart
async fn add_item(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    state
        .services
        .cart
        .add_item(user.user_id, payload.movie_id, payload.quantity)
        .await?;

    let view = state.services.cart.snapshot(user.user_id).await?;
    Ok(success_response(view))
}

/// Change the quantity of a movie already in the cart
async fn set_quantity(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(movie_id): Path<Uuid>,
    Json(payload): Json<SetQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    state
        .services
        .cart
        .set_quantity(user.user_id, movie_id, payload.quantity)
        .await?;

    let view = state.services.cart.snapshot(user.user_id).await?;
    Ok(success_response(view))
}

/// Remove a movie from the cart
async fn remove_item(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(movie_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .services
        .cart
        .remove_item(user.user_id, movie_id)
        .await?;
    Ok(no_content_response())
}

/// Clear the whole cart
async fn clear_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.cart.clear(user.user_id).await?;
    Ok(no_content_response())
}
