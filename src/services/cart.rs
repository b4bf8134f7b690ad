use crate::{
    entities::{cart, cart_item, order, order_item, Cart, CartItem, Movie, OrderItem},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, JoinType,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Per-user shopping cart.
///
/// Each user has at most one cart row (unique on user_id), so cart
/// mutations for a user serialize on that row. The order engine consumes
/// the cart read-only at checkout and clears it in the same transaction.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

/// A snapshot line: the cart item joined with the movie's current price.
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub movie_id: Uuid,
    pub title: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

/// The user-facing view of a cart.
#[derive(Debug, Serialize)]
pub struct CartView {
    pub user_id: Uuid,
    pub lines: Vec<CartLine>,
    pub total: Decimal,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Adds a movie to the user's cart.
    ///
    /// Rejects movies that do not exist or are unavailable, movies the user
    /// has already purchased, and duplicates of movies already in the cart.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        movie_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let movie = Movie::find_by_id(movie_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Movie {} not found", movie_id)))?;
        if !movie.available {
            return Err(ServiceError::ItemUnavailable(format!(
                "Movie {} is not available",
                movie_id
            )));
        }

        if self.user_owns_movie(&txn, user_id, movie_id).await? {
            return Err(ServiceError::Conflict(
                "You already bought this movie".to_string(),
            ));
        }

        let cart = self.get_or_create_cart(&txn, user_id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::MovieId.eq(movie_id))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "Movie is already in the cart".to_string(),
            ));
        }

        let item = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            movie_id: Set(movie_id),
            quantity: Set(quantity),
            added_at: Set(Utc::now()),
        };
        item.insert(&txn).await?;

        self.touch_cart(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                user_id,
                movie_id,
                quantity,
            })
            .await;

        info!("Added movie {} x{} to cart of {}", movie_id, quantity, user_id);
        Ok(())
    }

    /// Sets the quantity of a movie already in the cart. Quantity stays
    /// >= 1; removal is the explicit `remove_item` operation.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        user_id: Uuid,
        movie_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = self.find_cart(&txn, user_id).await?;
        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::MovieId.eq(movie_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Movie {} is not in the cart", movie_id))
            })?;

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.update(&txn).await?;

        self.touch_cart(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                user_id,
                movie_id,
                quantity,
            })
            .await;

        Ok(())
    }

    /// Removes a movie from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, user_id: Uuid, movie_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = self.find_cart(&txn, user_id).await?;
        let item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::MovieId.eq(movie_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Movie {} is not in the cart", movie_id))
            })?;

        CartItem::delete_by_id(item.id).exec(&txn).await?;

        self.touch_cart(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved { user_id, movie_id })
            .await;

        Ok(())
    }

    /// Returns the ordered contents of the user's cart priced at current
    /// catalog prices. An absent cart reads as empty.
    pub async fn snapshot(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        else {
            return Ok(CartView {
                user_id,
                lines: Vec::new(),
                total: Decimal::ZERO,
            });
        };

        let rows: Vec<(cart_item::Model, Option<crate::entities::MovieModel>)> = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::AddedAt)
            .find_also_related(Movie)
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for (item, movie) in rows {
            let movie = movie.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "cart references missing movie {}",
                    item.movie_id
                ))
            })?;
            let line_total = movie.price * Decimal::from(item.quantity);
            lines.push(CartLine {
                movie_id: item.movie_id,
                title: movie.title,
                unit_price: movie.price,
                quantity: item.quantity,
                line_total,
            });
        }

        let total = lines.iter().map(|l| l.line_total).sum();
        Ok(CartView {
            user_id,
            lines,
            total,
        })
    }

    /// Deletes every item from the user's cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = self.find_cart(&txn, user_id).await?;
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        self.touch_cart(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(user_id)).await;

        info!("Cleared cart of user {}", user_id);
        Ok(())
    }

    async fn find_cart<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart is empty".to_string()))
    }

    async fn get_or_create_cart<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        if let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?
        {
            return Ok(cart);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(cart.insert(conn).await?)
    }

    async fn touch_cart<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: cart::Model,
    ) -> Result<(), ServiceError> {
        let mut active: cart::ActiveModel = cart.into();
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }

    /// True when a paid order of this user contains the movie.
    async fn user_owns_movie<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        movie_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let owned = OrderItem::find()
            .join(JoinType::InnerJoin, order_item::Relation::Order.def())
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::Status.eq(order::OrderStatus::Paid))
            .filter(order_item::Column::MovieId.eq(movie_id))
            .one(conn)
            .await?;
        Ok(owned.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cart_view_totals() {
        let lines = vec![
            CartLine {
                movie_id: Uuid::new_v4(),
                title: "A".to_string(),
                unit_price: dec!(9.99),
                quantity: 1,
                line_total: dec!(9.99),
            },
            CartLine {
                movie_id: Uuid::new_v4(),
                title: "B".to_string(),
                unit_price: dec!(4.50),
                quantity: 2,
                line_total: dec!(9.00),
            },
        ];
        let total: Decimal = lines.iter().map(|l| l.line_total).sum();
        assert_eq!(total, dec!(18.99));
    }
}
