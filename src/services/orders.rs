use crate::{
    config::AppConfig,
    entities::{
        cart, cart_item, order, order_item, payment_attempt, Cart, CartItem, Movie, Order,
        OrderItem, OrderModel, OrderItemModel, OrderStatus, PaymentAttempt, PaymentAttemptModel,
        PaymentAttemptStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::notifications::NotificationService,
    services::payments::{
        derive_idempotency_key, ChargeRequest, GatewayChargeState, GatewayError, PaymentGateway,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, JoinType, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, RelationTrait, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// The order lifecycle engine.
///
/// Drives an order from cart snapshot to a terminal financial outcome:
///
/// ```text
/// Draft -> AwaitingPayment -> Paid | PaymentFailed | Cancelled
///             ^                         |
///             +------ user retry -------+   (bounded by max_payment_retries)
/// ```
///
/// Every transition is a guarded UPDATE on the order's `version` column, so
/// racing requests and callbacks for one order cannot both apply. The engine
/// is the sole writer of order and payment-attempt state.
#[derive(Clone)]
pub struct OrderLifecycleService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationService>,
    config: Arc<AppConfig>,
}

/// Order with its snapshotted line items
#[derive(Debug, Serialize)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Client-facing handle returned by `initiate_charge`: where to send the
/// customer, and which attempt the charge rides on.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentHandle {
    pub order_id: Uuid,
    pub attempt_id: Uuid,
    pub sequence: i32,
    pub gateway_reference: String,
    pub payment_url: String,
}

/// Outcome reported by an inbound gateway callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Succeeded,
    Failed,
}

/// Result of one reconciliation sweep.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub resolved: usize,
}

impl OrderLifecycleService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<NotificationService>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            notifications,
            config,
        }
    }

    /// Converts the user's cart into a Draft order.
    ///
    /// Availability is re-checked and prices re-fetched from the catalog at
    /// this instant; the resulting snapshot never changes afterwards. Order
    /// creation and cart clearing commit in one transaction: after a crash
    /// either the cart is intact and no order exists, or the cart is empty
    /// and exactly one Draft order exists.
    #[instrument(skip(self))]
    pub async fn checkout(&self, user_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::ValidationError("Cart is empty".to_string()))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::AddedAt)
            .all(&txn)
            .await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let mut unavailable = Vec::new();
        let mut order_items = Vec::with_capacity(items.len());
        let mut total = Decimal::ZERO;

        for item in &items {
            let movie = Movie::find_by_id(item.movie_id).one(&txn).await?;
            match movie {
                Some(movie) if movie.available => {
                    let line_total = movie.price * Decimal::from(item.quantity);
                    total += line_total;
                    order_items.push(order_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        order_id: Set(order_id),
                        movie_id: Set(item.movie_id),
                        title: Set(movie.title),
                        unit_price: Set(movie.price),
                        quantity: Set(item.quantity),
                        line_total: Set(line_total),
                        created_at: Set(now),
                    });
                }
                _ => unavailable.push(item.movie_id),
            }
        }

        if !unavailable.is_empty() {
            let ids: Vec<String> = unavailable.iter().map(|id| id.to_string()).collect();
            return Err(ServiceError::ItemUnavailable(format!(
                "Some movies are no longer available: {}",
                ids.join(", ")
            )));
        }

        let order_model = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            status: Set(OrderStatus::Draft),
            total_amount: Set(total),
            currency: Set(self.config.default_currency.clone()),
            frozen: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };
        let order_model = order_model.insert(&txn).await?;

        let mut inserted_items = Vec::with_capacity(order_items.len());
        for item in order_items {
            inserted_items.push(item.insert(&txn).await?);
        }

        // Cart is consumed by checkout, atomically with order creation
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCreated(order_id))
            .await;

        info!(
            "Checkout: order {} created for user {} (total {})",
            order_id, user_id, total
        );
        Ok(OrderWithItems {
            order: order_model,
            items: inserted_items,
        })
    }

    /// Initiates a charge for an order in `Draft` or `PaymentFailed`.
    ///
    /// The transition to `AwaitingPayment` and the new attempt row commit
    /// before the gateway is called, so a callback can never reference an
    /// attempt that does not exist yet. The gateway call itself runs under
    /// a bounded timeout; an elapsed timeout parks the attempt as `Unknown`
    /// for reconciliation and is never treated as a decline.
    #[instrument(skip(self))]
    pub async fn initiate_charge(&self, order_id: Uuid) -> Result<PaymentHandle, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Self::ensure_not_frozen(&order)?;
        if !order.status.can_initiate_charge() {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot initiate a charge from status {:?}",
                order.status
            )));
        }

        let attempts = PaymentAttempt::find()
            .filter(payment_attempt::Column::OrderId.eq(order_id))
            .count(&txn)
            .await? as i32;
        let sequence = attempts + 1;
        if sequence > self.config.max_payment_retries {
            return Err(ServiceError::InvalidOperation(
                "Charge retry budget exhausted".to_string(),
            ));
        }

        self.transition(&txn, &order, OrderStatus::AwaitingPayment)
            .await?;

        let now = Utc::now();
        let attempt = payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            sequence: Set(sequence),
            idempotency_key: Set(derive_idempotency_key(order_id, sequence)),
            gateway_reference: Set(None),
            status: Set(PaymentAttemptStatus::Pending),
            amount: Set(order.total_amount),
            currency: Set(order.currency.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let attempt = attempt.insert(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::ChargeInitiated {
                order_id,
                attempt_id: attempt.id,
                sequence,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: order.status,
                new_status: OrderStatus::AwaitingPayment,
            })
            .await;

        let request = ChargeRequest {
            idempotency_key: attempt.idempotency_key.clone(),
            order_id,
            amount: attempt.amount,
            currency: attempt.currency.clone(),
        };
        let timeout = Duration::from_secs(self.config.charge_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.gateway.charge(request)).await;

        match outcome {
            Ok(Ok(charge)) => {
                let mut active: payment_attempt::ActiveModel = attempt.clone().into();
                active.gateway_reference = Set(Some(charge.gateway_reference.clone()));
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;

                Ok(PaymentHandle {
                    order_id,
                    attempt_id: attempt.id,
                    sequence,
                    gateway_reference: charge.gateway_reference,
                    payment_url: charge.payment_url,
                })
            }
            Ok(Err(GatewayError::Declined(reason))) => {
                self.record_failure_by_attempt_id(attempt.id, None).await?;
                Err(ServiceError::PaymentFailed(reason))
            }
            Ok(Err(GatewayError::Timeout)) | Err(_) => {
                // Outcome unknown: park for reconciliation, never a decline
                self.park_attempt_unknown(attempt.id).await?;
                Err(ServiceError::GatewayTimeout)
            }
            Ok(Err(other)) => {
                self.park_attempt_unknown(attempt.id).await?;
                Err(ServiceError::ExternalServiceError(other.to_string()))
            }
        }
    }

    /// Applies an asynchronous gateway callback.
    ///
    /// Delivery is at-least-once and possibly reordered. A callback for an
    /// attempt already in a terminal state is acknowledged without side
    /// effects; a callback for a reference the engine has never seen is a
    /// NotFound so the gateway redelivers after the initiating transaction
    /// has committed.
    #[instrument(skip(self))]
    pub async fn handle_gateway_callback(
        &self,
        gateway_reference: &str,
        outcome: CallbackOutcome,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let attempt = PaymentAttempt::find()
            .filter(payment_attempt::Column::GatewayReference.eq(gateway_reference))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment attempt for gateway reference {}",
                    gateway_reference
                ))
            })?;

        if attempt.status.is_terminal() {
            info!(
                "Duplicate callback for attempt {} ({:?}); acknowledged without effect",
                attempt.id, attempt.status
            );
            return Ok(());
        }

        let order = Order::find_by_id(attempt.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("attempt {} has no order", attempt.id))
            })?;

        if order.frozen {
            warn!(
                "Callback for frozen order {} acknowledged without effect",
                order.id
            );
            return Ok(());
        }

        match outcome {
            CallbackOutcome::Succeeded => self.apply_success(txn, attempt, order, None).await,
            CallbackOutcome::Failed => self.apply_failure(txn, attempt, order, None).await,
        }
    }

    /// Sweeps orders stuck in `AwaitingPayment` past the configured
    /// threshold and resolves them against the gateway's ground truth.
    #[instrument(skip(self))]
    pub async fn reconcile_stale(&self) -> Result<ReconcileSummary, ServiceError> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.stale_payment_threshold_secs);

        let stale = Order::find()
            .filter(order::Column::Status.eq(OrderStatus::AwaitingPayment))
            .filter(order::Column::Frozen.eq(false))
            .filter(order::Column::UpdatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        let mut summary = ReconcileSummary::default();
        for order in stale {
            summary.examined += 1;
            match self.reconcile_order(&order).await {
                Ok(true) => summary.resolved += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconciliation of order {} failed: {}", order.id, e),
            }
        }

        if summary.examined > 0 {
            info!(
                "Reconciliation sweep: {} examined, {} resolved",
                summary.examined, summary.resolved
            );
        }
        Ok(summary)
    }

    async fn reconcile_order(&self, stale: &OrderModel) -> Result<bool, ServiceError> {
        let attempt = PaymentAttempt::find()
            .filter(payment_attempt::Column::OrderId.eq(stale.id))
            .order_by_desc(payment_attempt::Column::Sequence)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "order {} awaits payment without any attempt",
                    stale.id
                ))
            })?;

        if attempt.status.is_terminal() {
            return Ok(false);
        }

        let status = self
            .gateway
            .lookup(&attempt.idempotency_key)
            .await
            .map_err(|e| match e {
                GatewayError::Timeout => ServiceError::GatewayTimeout,
                other => ServiceError::ExternalServiceError(other.to_string()),
            })?;

        // Re-read inside a transaction: a callback may have landed meanwhile
        let txn = self.db.begin().await?;
        let attempt = PaymentAttempt::find_by_id(attempt.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("attempt vanished".to_string()))?;
        if attempt.status.is_terminal() {
            return Ok(false);
        }
        let order = Order::find_by_id(stale.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("order vanished".to_string()))?;
        if order.frozen {
            return Ok(false);
        }

        match status.state {
            GatewayChargeState::Succeeded => {
                self.apply_success(txn, attempt, order, status.gateway_reference)
                    .await?;
                Ok(true)
            }
            GatewayChargeState::Failed | GatewayChargeState::NotFound => {
                self.apply_failure(txn, attempt, order, status.gateway_reference)
                    .await?;
                Ok(true)
            }
            GatewayChargeState::Pending => Ok(false),
        }
    }

    /// Cancels an order.
    ///
    /// Draft and PaymentFailed orders cancel freely. An order awaiting
    /// payment cancels only once the gateway confirms no charge happened;
    /// terminal orders refuse.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Self::ensure_not_frozen(&order)?;

        match order.status {
            OrderStatus::Draft | OrderStatus::PaymentFailed => {
                let txn = self.db.begin().await?;
                self.transition(&txn, &order, OrderStatus::Cancelled).await?;
                txn.commit().await?;
                self.emit_cancelled(&order).await;
                self.reload_order(order_id).await
            }
            OrderStatus::AwaitingPayment => {
                let attempt = PaymentAttempt::find()
                    .filter(payment_attempt::Column::OrderId.eq(order_id))
                    .order_by_desc(payment_attempt::Column::Sequence)
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "order {} awaits payment without any attempt",
                            order_id
                        ))
                    })?;

                let status = self
                    .gateway
                    .lookup(&attempt.idempotency_key)
                    .await
                    .map_err(|e| match e {
                        GatewayError::Timeout => ServiceError::GatewayTimeout,
                        other => ServiceError::ExternalServiceError(other.to_string()),
                    })?;

                match status.state {
                    GatewayChargeState::NotFound | GatewayChargeState::Failed => {
                        let txn = self.db.begin().await?;
                        if !attempt.status.is_terminal() {
                            let mut active: payment_attempt::ActiveModel = attempt.into();
                            active.status = Set(PaymentAttemptStatus::Failed);
                            active.updated_at = Set(Utc::now());
                            active.update(&txn).await?;
                        }
                        self.transition(&txn, &order, OrderStatus::Cancelled).await?;
                        txn.commit().await?;
                        self.emit_cancelled(&order).await;
                        self.reload_order(order_id).await
                    }
                    GatewayChargeState::Succeeded => Err(ServiceError::InvalidOperation(
                        "A charge already completed for this order".to_string(),
                    )),
                    GatewayChargeState::Pending => Err(ServiceError::InvalidOperation(
                        "A charge is still in flight; try again later".to_string(),
                    )),
                }
            }
            OrderStatus::Paid | OrderStatus::Cancelled => Err(ServiceError::InvalidOperation(
                format!("Order in status {:?} cannot be cancelled", order.status),
            )),
        }
    }

    /// Fetches an order with its line items.
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    /// Lists orders, newest first, optionally filtered by user and status.
    pub async fn list_orders(
        &self,
        user_id: Option<Uuid>,
        status: Option<OrderStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let mut query = Order::find();
        if let Some(user_id) = user_id {
            query = query.filter(order::Column::UserId.eq(user_id));
        }
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((data, total))
    }

    /// Payment history for a user, newest first.
    pub async fn list_payment_attempts_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<PaymentAttemptModel>, u64), ServiceError> {
        let paginator = PaymentAttempt::find()
            .join(JoinType::InnerJoin, payment_attempt::Relation::Order.def())
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(payment_attempt::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((data, total))
    }

    // ---- internal transition machinery ----

    fn ensure_not_frozen(order: &OrderModel) -> Result<(), ServiceError> {
        if order.frozen {
            Err(ServiceError::DoublePaymentDetected(order.id))
        } else {
            Ok(())
        }
    }

    /// Guarded status transition: applies only if the order's version still
    /// matches the one read at decision time.
    async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &OrderModel,
        new_status: OrderStatus,
    ) -> Result<(), ServiceError> {
        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(order::Column::Version, Expr::value(order.version + 1))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        Ok(())
    }

    /// Freezes an order for manual review; every later transition refuses.
    async fn freeze<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &OrderModel,
    ) -> Result<(), ServiceError> {
        let result = Order::update_many()
            .col_expr(order::Column::Frozen, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(order::Column::Version, Expr::value(order.version + 1))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        Ok(())
    }

    /// Marks an attempt succeeded and the order paid, enforcing the
    /// at-most-one-succeeded-attempt invariant. Consumes and commits `txn`.
    async fn apply_success(
        &self,
        txn: DatabaseTransaction,
        attempt: PaymentAttemptModel,
        order: OrderModel,
        backfill_reference: Option<String>,
    ) -> Result<(), ServiceError> {
        let other_succeeded = PaymentAttempt::find()
            .filter(payment_attempt::Column::OrderId.eq(order.id))
            .filter(payment_attempt::Column::Status.eq(PaymentAttemptStatus::Succeeded))
            .filter(payment_attempt::Column::Id.ne(attempt.id))
            .one(&txn)
            .await?;

        if other_succeeded.is_some() {
            // A second successful charge for one order: never accepted
            // silently. Freeze and escalate; no auto-refund.
            let reference = attempt
                .gateway_reference
                .clone()
                .or(backfill_reference)
                .unwrap_or_default();
            self.freeze(&txn, &order).await?;
            txn.commit().await?;

            error!(
                order_id = %order.id,
                "Double payment detected (attempt {}); order frozen",
                attempt.id
            );
            self.event_sender
                .send_or_log(Event::DoublePaymentDetected {
                    order_id: order.id,
                    gateway_reference: reference,
                })
                .await;
            self.event_sender
                .send_or_log(Event::OrderFrozen(order.id))
                .await;
            return Ok(());
        }

        let attempt_id = attempt.id;
        let mut active: payment_attempt::ActiveModel = attempt.clone().into();
        if attempt.gateway_reference.is_none() {
            active.gateway_reference = Set(backfill_reference);
        }
        active.status = Set(PaymentAttemptStatus::Succeeded);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        if order.status == OrderStatus::Cancelled {
            // Money moved for an order that was already cancelled. Record
            // the ground truth, keep the terminal status, hold for review.
            self.freeze(&txn, &order).await?;
            txn.commit().await?;

            error!(
                order_id = %order.id,
                "Successful charge reported for a cancelled order; frozen for review"
            );
            self.event_sender
                .send_or_log(Event::OrderFrozen(order.id))
                .await;
            return Ok(());
        }

        self.transition(&txn, &order, OrderStatus::Paid).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentSucceeded {
                order_id: order.id,
                attempt_id,
                amount: order.total_amount,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: order.status,
                new_status: OrderStatus::Paid,
            })
            .await;

        // Enqueued exactly once: only on the non-terminal -> Succeeded flip
        self.notifications
            .enqueue_payment_confirmation(
                order.user_id,
                order.id,
                order.total_amount,
                &order.currency,
            )
            .await;

        info!("Order {} paid (attempt {})", order.id, attempt_id);
        Ok(())
    }

    /// Marks an attempt failed and moves the order to `PaymentFailed` or,
    /// with the retry budget exhausted, `Cancelled`. Consumes and commits
    /// `txn`.
    async fn apply_failure(
        &self,
        txn: DatabaseTransaction,
        attempt: PaymentAttemptModel,
        order: OrderModel,
        backfill_reference: Option<String>,
    ) -> Result<(), ServiceError> {
        let attempt_id = attempt.id;
        let sequence = attempt.sequence;
        let mut active: payment_attempt::ActiveModel = attempt.clone().into();
        if attempt.gateway_reference.is_none() {
            active.gateway_reference = Set(backfill_reference);
        }
        active.status = Set(PaymentAttemptStatus::Failed);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let new_status =
            Self::next_status_after_failure(sequence, self.config.max_payment_retries);
        if !order.status.is_terminal() {
            self.transition(&txn, &order, new_status).await?;
        }
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id: order.id,
                attempt_id,
            })
            .await;
        if !order.status.is_terminal() {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id: order.id,
                    old_status: order.status,
                    new_status,
                })
                .await;
            if new_status == OrderStatus::Cancelled {
                self.emit_cancelled(&order).await;
            }
        }

        Ok(())
    }

    /// A failed attempt leaves the order retryable until the budget is
    /// spent; the final failure cancels it.
    fn next_status_after_failure(sequence: i32, max_retries: i32) -> OrderStatus {
        if sequence >= max_retries {
            OrderStatus::Cancelled
        } else {
            OrderStatus::PaymentFailed
        }
    }

    async fn record_failure_by_attempt_id(
        &self,
        attempt_id: Uuid,
        backfill_reference: Option<String>,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let attempt = PaymentAttempt::find_by_id(attempt_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("attempt vanished".to_string()))?;
        if attempt.status.is_terminal() {
            return Ok(());
        }
        let order = Order::find_by_id(attempt.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("order vanished".to_string()))?;
        if order.frozen {
            return Ok(());
        }
        self.apply_failure(txn, attempt, order, backfill_reference)
            .await
    }

    async fn park_attempt_unknown(&self, attempt_id: Uuid) -> Result<(), ServiceError> {
        let attempt = PaymentAttempt::find_by_id(attempt_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::InternalError("attempt vanished".to_string()))?;
        if attempt.status.is_terminal() {
            return Ok(());
        }
        let mut active: payment_attempt::ActiveModel = attempt.into();
        active.status = Set(PaymentAttemptStatus::Unknown);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        Ok(())
    }

    async fn emit_cancelled(&self, order: &OrderModel) {
        self.event_sender
            .send_or_log(Event::OrderCancelled(order.id))
            .await;
        self.notifications
            .enqueue_order_cancelled(order.user_id, order.id)
            .await;
    }

    async fn reload_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }
}
