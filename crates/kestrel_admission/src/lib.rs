//! Admission control.
//!
//! Token and slot granters pace work by class (regular vs. elastic, KV vs.
//! SQL-response, store-IO vs. CPU) using signals from the engine's LSM
//! health and disk bandwidth. Requesters wait in per-class work queues; the
//! granter loop hands out capacity in priority order.

pub mod granter;
pub mod linear_model;
pub mod store_granter;
pub mod work_queue;

pub use granter::{CpuOverloadIndicator, GrantResult, SlotGranter, TokenGranter};
pub use linear_model::TokensLinearModel;
pub use store_granter::{DiskStats, StoreTokenGranter, StoreWorkDoneInfo};
pub use work_queue::WorkQueue;
