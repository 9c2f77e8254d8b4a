//! Order lifecycle: model, status matrix, state machine, engine and the
//! compensation pass.

pub mod compensation;
pub mod engine;
pub mod model;
pub mod state_machine;
pub mod stats;
pub mod status;
pub mod wallet;

pub use compensation::{CompensationConfig, CompensationReport, CompensationSweeper};
pub use engine::{CancelOutcome, EngineDeps, OrderEngine};
pub use model::{
    CreateOrderRequest, Goods, GoodsStatus, LedgerEntry, LedgerKind, ListQuery, Order, OrderView,
    Paged, PagedOrders, StatusHistoryEntry, Wallet,
};
pub use state_machine::{BatchOutcome, StateMachine, StateMachineConfig, TransitionOutcome};
pub use stats::{MerchantCounters, NoopStats, StatsRecorder};
pub use status::{Operator, OrderStatus};
