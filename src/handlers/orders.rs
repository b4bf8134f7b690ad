use crate::{
    auth::AuthenticatedUser,
    entities::OrderStatus,
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    AppState, PaginatedResponse,
};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/", get(list_all_orders))
        .route("/my", get(list_my_orders))
        .route("/:id", get(get_order))
        .route("/:id/pay", post(initiate_charge))
        .route("/:id/cancel", post(cancel_order))
}

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    pub status: Option<OrderStatus>,
    pub user_id: Option<Uuid>,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

/// Convert the user's cart into a Draft order
async fn checkout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.checkout(user.user_id).await?;
    Ok(created_response(order))
}

/// Initiate (or retry) the charge for an order
async fn initiate_charge(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    ensure_owner(&state, &user, id).await?;
    let handle = state.services.orders.initiate_charge(id).await?;
    Ok(success_response(handle))
}

/// Cancel an order
async fn cancel_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    ensure_owner(&state, &user, id).await?;
    let order = state.services.orders.cancel(id).await?;
    Ok(success_response(order))
}

/// Fetch one order with its line items
async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    if order.order.user_id != user.user_id && !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "Order belongs to another user".to_string(),
        ));
    }
    Ok(success_response(order))
}

/// The caller's own orders, newest first
async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<OrderListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let per_page = query.limit.clamp(1, 100);
    let (orders, total) = state
        .services
        .orders
        .list_orders(Some(user.user_id), query.status, query.page.max(1), per_page)
        .await?;

    Ok(success_response(PaginatedResponse {
        items: orders,
        total,
        page: query.page.max(1),
        limit: per_page,
        total_pages: total.div_ceil(per_page),
    }))
}

/// All orders with filters (admin)
async fn list_all_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<OrderListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_admin()
        .map_err(|_| ServiceError::Forbidden("Admin role required".to_string()))?;

    let per_page = query.limit.clamp(1, 100);
    let (orders, total) = state
        .services
        .orders
        .list_orders(query.user_id, query.status, query.page.max(1), per_page)
        .await?;

    Ok(success_response(PaginatedResponse {
        items: orders,
        total,
        page: query.page.max(1),
        limit: per_page,
        total_pages: total.div_ceil(per_page),
    }))
}

async fn ensure_owner(
    state: &AppState,
    user: &AuthenticatedUser,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    let order = state.services.orders.get_order(order_id).await?;
    if order.order.user_id != user.user_id && !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "Order belongs to another user".to_string(),
        ));
    }
    Ok(())
}
