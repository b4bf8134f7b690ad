use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::message_queue::{Message, MessageQueue};

/// Topic consumed by the email worker.
pub const EMAIL_TOPIC: &str = "notifications.email";

/// Fire-and-forget notification delivery.
///
/// Jobs are handed to the message queue and assumed delivered at least
/// once; a publish failure is logged, never propagated into the payment
/// path.
#[derive(Clone)]
pub struct NotificationService {
    queue: Arc<dyn MessageQueue>,
}

impl NotificationService {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Enqueues the payment-confirmation email for a freshly paid order.
    #[instrument(skip(self))]
    pub async fn enqueue_payment_confirmation(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) {
        let payload = json!({
            "type": "payment_confirmation",
            "user_id": user_id,
            "order_id": order_id,
            "amount": amount,
            "currency": currency,
        });
        self.publish(EMAIL_TOPIC, payload).await;
    }

    /// Enqueues the cancellation notice for an order.
    #[instrument(skip(self))]
    pub async fn enqueue_order_cancelled(&self, user_id: Uuid, order_id: Uuid) {
        let payload = json!({
            "type": "order_cancelled",
            "user_id": user_id,
            "order_id": order_id,
        });
        self.publish(EMAIL_TOPIC, payload).await;
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        match self
            .queue
            .publish(Message::new(topic.to_string(), payload))
            .await
        {
            Ok(()) => info!(topic, "Notification enqueued"),
            Err(e) => warn!(topic, "Failed to enqueue notification: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_queue::InMemoryMessageQueue;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn confirmation_lands_on_email_topic() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let service = NotificationService::new(queue.clone());

        service
            .enqueue_payment_confirmation(Uuid::new_v4(), Uuid::new_v4(), dec!(9.99), "USD")
            .await;

        let message = queue
            .subscribe(EMAIL_TOPIC)
            .await
            .unwrap()
            .expect("one message enqueued");
        assert_eq!(message.payload["type"], "payment_confirmation");
        assert!(queue.subscribe(EMAIL_TOPIC).await.unwrap().is_none());
    }
}
