mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use uuid::Uuid;

use cinema_api::errors::ServiceError;
use cinema_api::services::CallbackOutcome;

#[tokio::test]
async fn add_and_snapshot_cart() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let first = app.seed_movie("First Movie", dec!(9.99), true).await;
    let second = app.seed_movie("Second Movie", dec!(4.50), true).await;

    app.services.cart.add_item(user, first.id, 1).await.unwrap();
    app.services
        .cart
        .add_item(user, second.id, 2)
        .await
        .unwrap();

    let view = app.services.cart.snapshot(user).await.unwrap();
    assert_eq!(view.lines.len(), 2);
    // Snapshot preserves insertion order
    assert_eq!(view.lines[0].movie_id, first.id);
    assert_eq!(view.lines[1].movie_id, second.id);
    assert_eq!(view.lines[1].line_total, dec!(9.00));
    assert_eq!(view.total, dec!(18.99));
}

#[tokio::test]
async fn empty_cart_snapshot_is_empty() {
    let app = TestApp::new().await;
    let view = app.services.cart.snapshot(Uuid::new_v4()).await.unwrap();
    assert!(view.lines.is_empty());
    assert_eq!(view.total, dec!(0));
}

#[tokio::test]
async fn unknown_movie_is_rejected() {
    let app = TestApp::new().await;
    let err = app
        .services
        .cart
        .add_item(Uuid::new_v4(), Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn unavailable_movie_is_rejected() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Shelved", dec!(7.00), false).await;

    let err = app
        .services
        .cart
        .add_item(user, movie.id, 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ItemUnavailable(_));
}

#[tokio::test]
async fn duplicate_movie_is_rejected() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Once Only", dec!(3.99), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let err = app
        .services
        .cart
        .add_item(user, movie.id, 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn zero_quantity_is_rejected() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Some Movie", dec!(5.00), true).await;

    let err = app
        .services
        .cart
        .add_item(user, movie.id, 0)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    let err = app
        .services
        .cart
        .set_quantity(user, movie.id, 0)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn set_quantity_and_remove() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Adjustable", dec!(2.50), true).await;

    app.services.cart.add_item(user, movie.id, 1).await.unwrap();
    app.services
        .cart
        .set_quantity(user, movie.id, 4)
        .await
        .unwrap();

    let view = app.services.cart.snapshot(user).await.unwrap();
    assert_eq!(view.lines[0].quantity, 4);
    assert_eq!(view.total, dec!(10.00));

    app.services.cart.remove_item(user, movie.id).await.unwrap();
    let view = app.services.cart.snapshot(user).await.unwrap();
    assert!(view.lines.is_empty());

    // Removing again reports the movie as absent
    let err = app
        .services
        .cart
        .remove_item(user, movie.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn clear_cart_removes_everything() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let a = app.seed_movie("A", dec!(1.00), true).await;
    let b = app.seed_movie("B", dec!(2.00), true).await;

    app.services.cart.add_item(user, a.id, 1).await.unwrap();
    app.services.cart.add_item(user, b.id, 1).await.unwrap();
    app.services.cart.clear(user).await.unwrap();

    let view = app.services.cart.snapshot(user).await.unwrap();
    assert!(view.lines.is_empty());
}

#[tokio::test]
async fn purchased_movie_cannot_be_added_again() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let movie = app.seed_movie("Bought Already", dec!(9.99), true).await;

    // Buy the movie: checkout, charge, success callback
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

    let err = app
        .services
        .cart
        .add_item(user, movie.id, 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    // Carts of other users are unaffected
    app.services
        .cart
        .add_item(Uuid::new_v4(), movie.id, 1)
        .await
        .unwrap();
}
