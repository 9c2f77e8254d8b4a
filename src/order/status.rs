//! Order status model and the transition matrix.
//!
//! Statuses are stored as lowercase text. The matrix is the single source
//! of truth for which operator may move an order between two statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Created, waiting for payment
    Pending,
    Paid,
    Shipped,
    Delivered,
    /// Terminal
    Completed,
    /// Terminal
    Cancelled,
    /// Terminal
    Refunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    /// `completed` is terminal for the normal flow; an admin may still refund it.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Money has moved from the buyer for this order.
    #[inline]
    pub fn was_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Shipped | OrderStatus::Delivered | OrderStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who requested a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    User,
    System,
    Admin,
    Merchant,
    Courier,
}

impl Operator {
    pub const ALL: [Operator; 5] = [
        Operator::User,
        Operator::System,
        Operator::Admin,
        Operator::Merchant,
        Operator::Courier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::User => "user",
            Operator::System => "system",
            Operator::Admin => "admin",
            Operator::Merchant => "merchant",
            Operator::Courier => "courier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operators allowed to move `from -> to`. Empty slice: transition illegal.
pub fn allowed_operators(from: OrderStatus, to: OrderStatus) -> &'static [Operator] {
    use Operator::*;
    use OrderStatus::*;

    match (from, to) {
        (Pending, Paid) => &[User, System],
        (Pending, Cancelled) => &[User, System, Admin],
        (Paid, Shipped) => &[Merchant, Admin],
        (Paid, Refunded) => &[Admin, System],
        (Paid, Cancelled) => &[Admin],
        (Shipped, Delivered) => &[System, Courier, Admin],
        (Shipped, Refunded) => &[Admin],
        (Delivered, Completed) => &[User, System],
        (Delivered, Refunded) => &[Admin, User],
        (Completed, Refunded) => &[Admin],
        _ => &[],
    }
}

/// Target statuses `operator` may move an order in `from` to.
pub fn allowed_transitions(from: OrderStatus, operator: Operator) -> Vec<OrderStatus> {
    OrderStatus::ALL
        .into_iter()
        .filter(|to| allowed_operators(from, *to).contains(&operator))
        .collect()
}

/// Reject with `IllegalTransition` unless the matrix allows it.
pub fn validate_transition(
    from: OrderStatus,
    to: OrderStatus,
    operator: Operator,
) -> EngineResult<()> {
    if allowed_operators(from, to).contains(&operator) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
            operator: operator.to_string(),
        })
    }
}
