//! Wallet movements inside a store transaction.
//!
//! Every balance change writes its ledger entry in the same transaction, and
//! `balance_before + sign * amount == balance_after` always holds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::core_types::{LedgerId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::store::StoreTx;

use super::model::{LedgerKind, NewLedgerEntry};

/// Retry schedule for conditional updates that report "no rows affected".
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Linear: `backoff * (retry + 1)`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff * (retry + 1)
    }
}

/// Stock decrement with the conditional predicate, retried per `policy`.
pub async fn decrement_stock(
    tx: &mut dyn StoreTx,
    goods_id: i64,
    quantity: i32,
    policy: RetryPolicy,
) -> EngineResult<()> {
    for retry in 0..policy.attempts {
        if tx.decrement_stock(goods_id, quantity).await? {
            return Ok(());
        }
        debug!(goods_id, retry, "Stock conditional update missed, retrying");
        tokio::time::sleep(policy.delay(retry)).await;
    }
    Err(EngineError::OptimisticConflict(format!(
        "stock update for goods {goods_id} failed after {} attempts",
        policy.attempts
    )))
}

/// Debit movement (`order_payment` or `booking_payment`).
#[derive(Debug, Clone)]
pub struct Debit<'a> {
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: LedgerKind,
    pub description: &'a str,
    pub reference_no: &'a str,
}

/// Debit if the balance covers it.
///
/// `Ok(None)`: balance too low, nothing written. `Ok(Some(id))`: debited and
/// ledger entry `id` written.
pub async fn try_debit(
    tx: &mut dyn StoreTx,
    debit: Debit<'_>,
    at: DateTime<Utc>,
    policy: RetryPolicy,
) -> EngineResult<Option<LedgerId>> {
    if debit.kind.sign() != Decimal::NEGATIVE_ONE {
        return Err(EngineError::Internal(format!("{} is a credit", debit.kind.as_str())));
    }
    let user_id = debit.user_id;
    let wallet = tx.ensure_wallet(user_id, at).await?;
    if wallet.balance < debit.amount {
        return Ok(None);
    }

    let mut debited = false;
    for retry in 0..policy.attempts {
        if tx.debit_wallet(user_id, debit.amount, at).await? {
            debited = true;
            break;
        }
        debug!(user_id, retry, "Wallet conditional update missed, retrying");
        tokio::time::sleep(policy.delay(retry)).await;
    }
    if !debited {
        return Err(EngineError::OptimisticConflict(format!(
            "wallet debit for user {user_id} failed after {} attempts",
            policy.attempts
        )));
    }

    let id = tx
        .insert_ledger(NewLedgerEntry {
            user_id,
            kind: debit.kind,
            amount: debit.amount,
            balance_before: wallet.balance,
            balance_after: wallet.balance - debit.amount,
            description: debit.description.to_string(),
            reference_no: Some(debit.reference_no.to_string()),
            ref_entry_id: None,
            created_at: at,
        })
        .await?;
    Ok(Some(id))
}

/// Debit or fail with `InsufficientBalance`.
pub async fn debit(
    tx: &mut dyn StoreTx,
    debit: Debit<'_>,
    at: DateTime<Utc>,
    policy: RetryPolicy,
) -> EngineResult<LedgerId> {
    try_debit(tx, debit, at, policy)
        .await?
        .ok_or(EngineError::InsufficientBalance)
}

/// Credit movement (`system_refund` or `recharge`).
#[derive(Debug, Clone)]
pub struct Credit<'a> {
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: LedgerKind,
    pub description: &'a str,
    pub reference_no: Option<&'a str>,
    pub ref_entry_id: Option<LedgerId>,
}

pub async fn credit(
    tx: &mut dyn StoreTx,
    credit: Credit<'_>,
    at: DateTime<Utc>,
) -> EngineResult<LedgerId> {
    if credit.kind.sign() != Decimal::ONE {
        return Err(EngineError::Internal(format!("{} is a debit", credit.kind.as_str())));
    }
    let wallet = tx.ensure_wallet(credit.user_id, at).await?;
    tx.credit_wallet(credit.user_id, credit.amount, at).await?;
    tx.insert_ledger(NewLedgerEntry {
        user_id: credit.user_id,
        kind: credit.kind,
        amount: credit.amount,
        balance_before: wallet.balance,
        balance_after: wallet.balance + credit.amount,
        description: credit.description.to_string(),
        reference_no: credit.reference_no.map(str::to_string),
        ref_entry_id: credit.ref_entry_id,
        created_at: at,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};

    #[test]
    fn test_linear_backoff() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(10));
        assert_eq!(p.delay(2), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_debit_writes_consistent_ledger() {
        let store = MemoryStore::new();
        store.seed_wallet(1, Decimal::new(10000, 2)).await;

        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        debit(
            tx.as_mut(),
            Debit {
                user_id: 1,
                amount: Decimal::new(2550, 2),
                kind: LedgerKind::OrderPayment,
                description: "order payment",
                reference_no: "ORD1",
            },
            now,
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(snap.wallets[&1].balance, Decimal::new(7450, 2));
        assert_eq!(snap.ledger.len(), 1);
        let e = &snap.ledger[0];
        assert!(e.is_consistent());
        assert_eq!(e.kind, LedgerKind::OrderPayment);
        assert_eq!(e.reference_no.as_deref(), Some("ORD1"));
    }

    #[tokio::test]
    async fn test_low_balance_writes_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let got = try_debit(
            tx.as_mut(),
            Debit {
                user_id: 2,
                amount: Decimal::ONE,
                kind: LedgerKind::OrderPayment,
                description: "order payment",
                reference_no: "ORD2",
            },
            Utc::now(),
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert!(got.is_none());
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert!(snap.ledger.is_empty());
        // wallet row is created with zero balance
        assert_eq!(snap.wallets[&2].balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_credit_creates_wallet() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        credit(
            tx.as_mut(),
            Credit {
                user_id: 3,
                amount: Decimal::new(500, 2),
                kind: LedgerKind::Recharge,
                description: "recharge",
                reference_no: None,
                ref_entry_id: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(snap.wallets[&3].balance, Decimal::new(500, 2));
        assert!(snap.ledger[0].is_consistent());
    }
}
