//! Per-merchant order statistics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core_types::MerchantId;
use crate::error::EngineResult;
use crate::store::StoreTx;

/// Best-effort counters updated inside the order-create transaction.
/// Errors are logged by the caller and never abort the order.
#[async_trait]
pub trait StatsRecorder: Send + Sync {
    async fn record(
        &self,
        tx: &mut dyn StoreTx,
        merchant_id: MerchantId,
        order_no: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;
}

/// Counters kept in the relational store next to the order.
pub struct MerchantCounters;

#[async_trait]
impl StatsRecorder for MerchantCounters {
    async fn record(
        &self,
        tx: &mut dyn StoreTx,
        merchant_id: MerchantId,
        order_no: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        tx.record_merchant_stats(merchant_id, order_no, amount, at).await
    }
}

pub struct NoopStats;

#[async_trait]
impl StatsRecorder for NoopStats {
    async fn record(
        &self,
        _tx: &mut dyn StoreTx,
        _merchant_id: MerchantId,
        _order_no: &str,
        _amount: Decimal,
        _at: DateTime<Utc>,
    ) -> EngineResult<()> {
        Ok(())
    }
}
