use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    handlers::common::success_response,
    AppState, ListQuery, PaginatedResponse,
};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};

/// Creates the router for payment history endpoints
pub fn payments_routes() -> Router<AppState> {
    Router::new().route("/my", get(list_my_payments))
}

/// The caller's payment attempts, newest first
async fn list_my_payments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let per_page = query.limit.clamp(1, 100);
    let (attempts, total) = state
        .services
        .orders
        .list_payment_attempts_for_user(user.user_id, query.page.max(1), per_page)
        .await?;

    Ok(success_response(PaginatedResponse {
        items: attempts,
        total,
        page: query.page.max(1),
        limit: per_page,
        total_pages: total.div_ceil(per_page),
    }))
}
