//! Per-subscription and process-wide caches.
//!
//! [`transactions::TransactionCache`] reconciles what a subscription has
//! already been sent against what keeps arriving live; one instance exists
//! per subscription and is owned by its mediator task. [`header_cache`] is a
//! process-wide lookup cache shared by all header replays.

pub mod header_cache;
pub mod transactions;

pub use header_cache::HeaderCache;
pub use transactions::TransactionCache;
