use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        user_id: Uuid,
        movie_id: Uuid,
        quantity: i32,
    },
    CartItemUpdated {
        user_id: Uuid,
        movie_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        user_id: Uuid,
        movie_id: Uuid,
    },
    CartCleared(Uuid),

    // Catalog events
    MovieCreated(Uuid),
    MovieAvailabilityChanged {
        movie_id: Uuid,
        available: bool,
    },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),

    // Payment events
    ChargeInitiated {
        order_id: Uuid,
        attempt_id: Uuid,
        sequence: i32,
    },
    PaymentSucceeded {
        order_id: Uuid,
        attempt_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        order_id: Uuid,
        attempt_id: Uuid,
    },
    /// A second successful charge was reported for an order that already
    /// has one. Never auto-resolved; the order is frozen for manual review.
    DoublePaymentDetected {
        order_id: Uuid,
        gateway_reference: String,
    },
    OrderFrozen(Uuid),
}

// Define a trait for handling events. Handlers implementing this trait will
// process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

// Function to process incoming events and distribute them to registered
// event handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::DoublePaymentDetected {
                order_id,
                ref gateway_reference,
            } => {
                // Escalation channel: operations alert on error-level logs
                error!(
                    order_id = %order_id,
                    gateway_reference = %gateway_reference,
                    "Double payment detected; order frozen pending manual review"
                );
            }
            Event::OrderFrozen(order_id) => {
                error!(order_id = %order_id, "Order frozen");
            }
            Event::PaymentFailed {
                order_id,
                attempt_id,
            } => {
                warn!(order_id = %order_id, attempt_id = %attempt_id, "Payment failed");
            }
            Event::PaymentSucceeded {
                order_id,
                attempt_id,
                amount,
            } => {
                info!(order_id = %order_id, attempt_id = %attempt_id, %amount, "Payment succeeded");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    "Order status changed: {:?} -> {:?}",
                    old_status,
                    new_status
                );
            }
            other => {
                info!("Event: {:?}", other);
            }
        }
    }

    info!("Event processing loop stopped");
}
