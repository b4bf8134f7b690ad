mod common;

use assert_matches::assert_matches;
use common::{ChargeScript, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use cinema_api::entities::{
    cart_item, payment_attempt, CartItem, Order, OrderStatus, PaymentAttempt,
    PaymentAttemptStatus,
};
use cinema_api::errors::ServiceError;
use cinema_api::services::CallbackOutcome;

async fn succeeded_attempt_count(app: &TestApp, order_id: Uuid) -> u64 {
    PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order_id))
        .filter(payment_attempt::Column::Status.eq(PaymentAttemptStatus::Succeeded))
        .count(&*app.db)
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_path_checkout_charge_and_confirm() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("movie-42", dec!(9.99), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();

    // Checkout: Draft order, price snapshotted, cart cleared
    let checkout = app.services.orders.checkout(user).await.unwrap();
    assert_eq!(checkout.order.status, OrderStatus::Draft);
    assert_eq!(checkout.order.total_amount, dec!(9.99));
    assert_eq!(checkout.items.len(), 1);
    assert_eq!(checkout.items[0].unit_price, dec!(9.99));
    assert!(app
        .services
        .cart
        .snapshot(user)
        .await
        .unwrap()
        .lines
        .is_empty());

    // InitiateCharge: AwaitingPayment plus a pending attempt with a handle
    let handle = app
        .services
        .orders
        .initiate_charge(checkout.order.id)
        .await
        .unwrap();
    assert_eq!(handle.sequence, 1);
    assert!(handle.payment_url.starts_with("https://pay.test/"));

    let order = app
        .services
        .orders
        .get_order(checkout.order.id)
        .await
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::AwaitingPayment);

    // Success callback: Paid, attempt succeeded, one confirmation email
    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Succeeded)
        .await
        .unwrap();

    let order = app
        .services
        .orders
        .get_order(checkout.order.id)
        .await
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Paid);
    assert_eq!(succeeded_attempt_count(&app, checkout.order.id).await, 1);

    let emails = app.drain_emails().await;
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].payload["type"], "payment_confirmation");
}

#[tokio::test]
async fn duplicate_success_callback_is_a_no_op() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Dup Callback", dec!(5.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();
    let handle = app
        .services
        .orders
        .initiate_charge(order.order.id)
        .await
        .unwrap();

    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Succeeded)
        .await
        .unwrap();
    // Redelivery of the identical callback
    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Succeeded)
        .await
        .unwrap();
    // An out-of-order failure for the same (terminal) attempt is also inert
    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();

    let reloaded = app.services.orders.get_order(order.order.id).await.unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::Paid);
    assert_eq!(succeeded_attempt_count(&app, order.order.id).await, 1);

    // Exactly one notification despite three deliveries
    assert_eq!(app.drain_emails().await.len(), 1);
}

#[tokio::test]
async fn empty_cart_cannot_check_out() {
    let app = TestApp::new().await;
    let err = app
        .services
        .orders
        .checkout(Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn checkout_is_atomic_when_a_movie_goes_unavailable() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let kept = app.seed_movie("Still Here", dec!(3.00), true).await;
    let pulled = app.seed_movie("Pulled", dec!(4.00), true).await;

    app.services.cart.add_item(user, kept.id, 1).await.unwrap();
    app.services.cart.add_item(user, pulled.id, 1).await.unwrap();

    app.services
        .catalog
        .set_availability(pulled.id, false)
        .await
        .unwrap();

    let err = app.services.orders.checkout(user).await.unwrap_err();
    assert_matches!(err, ServiceError::ItemUnavailable(_));

    // Nothing happened: no order rows, cart untouched
    assert_eq!(Order::find().count(&*app.db).await.unwrap(), 0);
    let remaining = CartItem::find()
        .filter(cart_item::Column::MovieId.is_in([kept.id, pulled.id]))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(remaining, 2);
}

#[tokio::test]
async fn client_prices_are_ignored_at_checkout() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Repriced", dec!(10.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();

    // Price changes between add-to-cart and checkout; the snapshot takes
    // the catalog's price at checkout time.
    use sea_orm::{ActiveModelTrait, Set};
    let mut active: cinema_api::entities::movie::ActiveModel = movie.into();
    active.price = Set(dec!(12.00));
    active.update(&*app.db).await.unwrap();

    let checkout = app.services.orders.checkout(user).await.unwrap();
    assert_eq!(checkout.order.total_amount, dec!(12.00));
}

#[tokio::test]
async fn retry_budget_is_enforced() {
    let mut cfg = TestApp::test_config();
    cfg.max_payment_retries = 2;
    let app = TestApp::with_config(cfg).await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Hard To Pay", dec!(8.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();
    let order_id = order.order.id;

    // First attempt fails via callback: budget remains, order retryable
    let handle = app.services.orders.initiate_charge(order_id).await.unwrap();
    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();
    let reloaded = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::PaymentFailed);

    // Second (final) attempt fails: budget exhausted, order cancelled
    let handle = app.services.orders.initiate_charge(order_id).await.unwrap();
    assert_eq!(handle.sequence, 2);
    app.services
        .orders
        .handle_gateway_callback(&handle.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();
    let reloaded = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::Cancelled);

    // No further charge is possible
    let err = app
        .services
        .orders
        .initiate_charge(order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
    assert_eq!(app.gateway.recorded_charges().len(), 2);
}

#[tokio::test]
async fn declined_charge_counts_against_the_budget() {
    let mut cfg = TestApp::test_config();
    cfg.max_payment_retries = 1;
    let app = TestApp::with_config(cfg).await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Declined", dec!(6.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();

    app.gateway
        .push_charge_result(ChargeScript::Decline("card declined".to_string()));
    let err = app
        .services
        .orders
        .initiate_charge(order.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentFailed(_));

    // Single-attempt budget spent synchronously: order is cancelled
    let reloaded = app.services.orders.get_order(order.order.id).await.unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn concurrent_charge_initiation_yields_one_charge() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Raced", dec!(7.50), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();
    let order_id = order.order.id;

    let orders_a = app.services.orders.clone();
    let orders_b = app.services.orders.clone();
    let (a, b) = tokio::join!(
        orders_a.initiate_charge(order_id),
        orders_b.initiate_charge(order_id)
    );

    // Exactly one initiation wins; the loser sees a conflict (version
    // guard) or the already-transitioned status.
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    for result in [a, b] {
        if let Err(err) = result {
            assert_matches!(
                err,
                ServiceError::ConcurrentModification(_) | ServiceError::InvalidOperation(_)
            );
        }
    }

    // Exactly one attempt row and one gateway charge
    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order_id))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(attempts, 1);
    assert_eq!(app.gateway.recorded_charges().len(), 1);
}

#[tokio::test]
async fn second_successful_attempt_freezes_the_order() {
    let mut cfg = TestApp::test_config();
    cfg.max_payment_retries = 5;
    let app = TestApp::with_config(cfg).await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Paid Twice", dec!(20.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();
    let order_id = order.order.id;

    // Attempt 1 fails, attempt 2 succeeds: the order is Paid
    let first = app.services.orders.initiate_charge(order_id).await.unwrap();
    app.services
        .orders
        .handle_gateway_callback(&first.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();
    let second = app.services.orders.initiate_charge(order_id).await.unwrap();
    app.services
        .orders
        .handle_gateway_callback(&second.gateway_reference, CallbackOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(app.drain_emails().await.len(), 1);

    // A third attempt cannot be initiated on a paid order, but suppose the
    // gateway later reports success for the failed first attempt again via
    // a brand-new reference race: simulate by succeeding attempt 1 whose
    // terminal state guards it.
    app.services
        .orders
        .handle_gateway_callback(&first.gateway_reference, CallbackOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(succeeded_attempt_count(&app, order_id).await, 1);

    // Now force a genuine double-success: park a fresh pending attempt by
    // hand and deliver success for it.
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, Set};
    let rogue = payment_attempt::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        sequence: Set(3),
        idempotency_key: Set(format!("rogue-{}", order_id)),
        gateway_reference: Set(Some("gw_rogue".to_string())),
        status: Set(PaymentAttemptStatus::Pending),
        amount: Set(dec!(20.00)),
        currency: Set("USD".to_string()),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*app.db)
    .await
    .unwrap();

    app.services
        .orders
        .handle_gateway_callback("gw_rogue", CallbackOutcome::Succeeded)
        .await
        .unwrap();

    // Invariant held: still exactly one succeeded attempt; order frozen
    assert_eq!(succeeded_attempt_count(&app, order_id).await, 1);
    let frozen = Order::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(frozen.frozen);
    assert_eq!(frozen.status, OrderStatus::Paid);

    let rogue_reloaded = PaymentAttempt::find_by_id(rogue.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(rogue_reloaded.status, PaymentAttemptStatus::Succeeded);

    // No second confirmation email, and the frozen order refuses work
    assert!(app.drain_emails().await.is_empty());
    let err = app
        .services
        .orders
        .initiate_charge(order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::DoublePaymentDetected(_));
}

#[tokio::test]
async fn unknown_gateway_reference_is_not_found() {
    let app = TestApp::new().await;
    let err = app
        .services
        .orders
        .handle_gateway_callback("gw_never_seen", CallbackOutcome::Succeeded)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn idempotency_keys_are_stable_per_attempt() {
    let mut cfg = TestApp::test_config();
    cfg.max_payment_retries = 3;
    let app = TestApp::with_config(cfg).await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Keyed", dec!(1.00), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let order = app.services.orders.checkout(user).await.unwrap();
    let order_id = order.order.id;

    let first = app.services.orders.initiate_charge(order_id).await.unwrap();
    app.services
        .orders
        .handle_gateway_callback(&first.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();
    let second = app.services.orders.initiate_charge(order_id).await.unwrap();
    app.services
        .orders
        .handle_gateway_callback(&second.gateway_reference, CallbackOutcome::Failed)
        .await
        .unwrap();

    let charges = app.gateway.recorded_charges();
    assert_eq!(charges.len(), 2);
    assert_ne!(charges[0].idempotency_key, charges[1].idempotency_key);
    assert_eq!(
        charges[0].idempotency_key,
        cinema_api::services::payments::derive_idempotency_key(order_id, 1)
    );
    assert_eq!(
        charges[1].idempotency_key,
        cinema_api::services::payments::derive_idempotency_key(order_id, 2)
    );
}
