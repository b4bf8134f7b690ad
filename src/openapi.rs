use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::errors::ErrorResponse;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cinema API",
        description = "Online-cinema store: catalog, carts, orders and payments"
    ),
    paths(crate::handlers::payment_webhooks::payment_webhook),
    components(schemas(ErrorResponse)),
    tags(
        (name = "Payments", description = "Payment lifecycle and webhook ingress")
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at /docs, serving the generated document.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
