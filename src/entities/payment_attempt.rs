use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One charge attempt against the payment gateway.
///
/// `sequence` numbers attempts per order starting at 1; the idempotency key
/// is derived deterministically from (order, sequence) so a retried network
/// call cannot double-charge. `gateway_reference` is filled in once the
/// gateway has acknowledged the charge; a timed-out attempt stays `Unknown`
/// with no reference until reconciliation resolves it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub sequence: i32,
    #[sea_orm(unique)]
    pub idempotency_key: String,
    #[sea_orm(nullable)]
    pub gateway_reference: Option<String>,
    pub status: PaymentAttemptStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Payment attempt status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentAttemptStatus {
    /// Charge submitted, outcome not yet reported.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Charge call timed out; outcome must come from reconciliation.
    #[sea_orm(string_value = "unknown")]
    Unknown,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl PaymentAttemptStatus {
    /// Terminal attempts are never updated again; a duplicate callback
    /// for one is acknowledged without side effects.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentAttemptStatus::Succeeded | PaymentAttemptStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_attempt_statuses() {
        assert!(PaymentAttemptStatus::Succeeded.is_terminal());
        assert!(PaymentAttemptStatus::Failed.is_terminal());
        assert!(!PaymentAttemptStatus::Pending.is_terminal());
        assert!(!PaymentAttemptStatus::Unknown.is_terminal());
    }
}
