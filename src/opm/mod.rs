//! Object Pool Manager: pooled, resizable allocation for hot-path objects

pub mod manager;
pub mod pool;

pub use manager::Opm;
pub use pool::{
    DEFAULT_CAPACITY_INCREMENT, DEFAULT_THRESHOLD_PERCENTAGE, GrowthMode, PoolId, PoolStats,
    Poolable, PooledObject, SyncObjectPool, UNKNOWN_POOL_ID,
};
