//! Task store and credit ledger.
//!
//! This crate provides:
//! - `TaskStore`: task records mutated only through the task state machine
//! - `CreditLedger`: balances with fail-closed debit and idempotent refunds
//! - Redis implementations (versioned compare-and-set, Lua) and in-memory ones

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryCreditLedger, MemoryTaskStore};
pub use redis_store::{RedisCreditLedger, RedisTaskStore};
pub use store::{
    refund_key, CreditLedger, StoreConfig, TaskStore, MAX_UPDATE_RETRIES, RETRY_BASE_DELAY_MS,
};
