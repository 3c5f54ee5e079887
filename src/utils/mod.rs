//! # Utility Modules
//!
//! Supporting utilities for pooling, logging, metrics and timing.
//!
//! ## Components
//! - **Pool**: bounded object pool with take-out/take-in/remove hooks
//! - **Buffer Pool**: reusable per-write I/O descriptors built on the pool
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: default durations and async timeout wrappers

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod timeout;

pub use buffer_pool::{DescriptorPool, IoDescriptor, PooledDescriptor};
pub use pool::ObjectPool;
