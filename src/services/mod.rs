pub mod cart;
pub mod catalog;
pub mod notifications;
pub mod orders;
pub mod payments;

// Re-export services for convenience
pub use cart::{CartLine, CartService, CartView};
pub use catalog::{CatalogService, CreateMovieInput};
pub use notifications::NotificationService;
pub use orders::{
    CallbackOutcome, OrderLifecycleService, OrderWithItems, PaymentHandle, ReconcileSummary,
};
pub use payments::{HttpPaymentGateway, PaymentGateway};
