pub mod cart;
pub mod cart_item;
pub mod movie;
pub mod order;
pub mod order_item;
pub mod payment_attempt;

// Re-export entities
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use movie::{Entity as Movie, Model as MovieModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use payment_attempt::{
    Entity as PaymentAttempt, Model as PaymentAttemptModel, PaymentAttemptStatus,
};
