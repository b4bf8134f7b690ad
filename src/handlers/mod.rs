pub mod carts;
pub mod common;
pub mod movies;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::message_queue::MessageQueue;
use crate::services::{
    CartService, CatalogService, NotificationService, OrderLifecycleService, PaymentGateway,
};
use std::sync::Arc;

// Re-export route builders
pub use carts::carts_routes;
pub use movies::movies_routes;
pub use orders::orders_routes;
pub use payments::payments_routes;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderLifecycleService>,
    pub notifications: Arc<NotificationService>,
}

impl AppServices {
    /// Wires the service graph over the shared pool, event channel,
    /// payment gateway and notification queue.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        message_queue: Arc<dyn MessageQueue>,
        config: Arc<AppConfig>,
    ) -> Self {
        let catalog = Arc::new(CatalogService::new(db_pool.clone(), event_sender.clone()));
        let cart = Arc::new(CartService::new(db_pool.clone(), event_sender.clone()));
        let notifications = Arc::new(NotificationService::new(message_queue));
        let orders = Arc::new(OrderLifecycleService::new(
            db_pool,
            event_sender,
            gateway,
            notifications.clone(),
            config,
        ));

        Self {
            catalog,
            cart,
            orders,
            notifications,
        }
    }
}
