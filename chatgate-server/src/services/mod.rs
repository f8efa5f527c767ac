//! Chat pipeline services and their storage collaborators.

pub mod admission;
pub mod backend;
pub mod clock;
pub mod counter_store;
pub mod fast_tier;
pub mod history_cache;
pub mod repository;
pub mod stream_bridge;
pub mod task_pool;
pub mod tenants;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{AdmissionController, NoopAdmission, QuotaAdmission};
pub use history_cache::HistoryCache;
pub use stream_bridge::{ChatBridge, ChatError};
pub use task_pool::TaskPool;
