//! Object Pool Manager: the process-wide registry of typed pools

use crate::error::{Error, Result};
use crate::opm::pool::{
    GrowthMode, PoolId, PoolStats, Poolable, PooledObject, SyncObjectPool,
};
use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

trait PoolInfo: Send + Sync {
    fn stats(&self) -> PoolStats;
}

impl<T: Poolable> PoolInfo for SyncObjectPool<T> {
    fn stats(&self) -> PoolStats {
        SyncObjectPool::stats(self)
    }
}

struct PoolEntry {
    type_id: TypeId,
    init_param: i64,
    any: Arc<dyn Any + Send + Sync>,
    info: Arc<dyn PoolInfo>,
}

/// Typed reusable-object allocator.
///
/// Pools are keyed by (object type, init param): creating a pool that
/// already exists returns the existing id. Pool ids are indices into the
/// manager's pool table and stay valid until [`Opm::shutdown`].
pub struct Opm {
    pools: Mutex<Vec<PoolEntry>>,
}

impl Opm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { pools: Mutex::new(Vec::new()) })
    }

    /// Create a pool of `T`, or return the id of the existing pool with the
    /// same (type, init param) key.
    pub fn create_pool<T: Poolable>(
        &self,
        init_param: i64,
        threshold_percentage: f64,
        capacity_increment: usize,
        initial_capacity: usize,
        growth_mode: GrowthMode,
    ) -> Result<PoolId> {
        if initial_capacity == 0 {
            return Err(Error::InvalidArgument(
                "initial capacity must be greater than 0".into(),
            ));
        }
        if growth_mode != GrowthMode::NoGrowth {
            if !(0.0..=1.0).contains(&threshold_percentage) || threshold_percentage == 0.0 {
                return Err(Error::InvalidArgument(
                    "threshold percentage must be in (0, 1]".into(),
                ));
            }
            if capacity_increment == 0 {
                return Err(Error::InvalidArgument(
                    "capacity increment must be greater than 0".into(),
                ));
            }
        }

        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());

        let type_id = TypeId::of::<T>();
        for (index, entry) in pools.iter().enumerate() {
            if entry.type_id == type_id && entry.init_param == init_param {
                return Ok(index as PoolId);
            }
        }

        let pool_id = pools.len() as PoolId;
        let object_type = std::any::type_name::<T>();
        let pool = SyncObjectPool::<T>::new(
            pool_id,
            object_type,
            init_param,
            threshold_percentage,
            capacity_increment,
            initial_capacity,
            growth_mode,
        );
        info!(
            "created pool {} for {} (initial {}, {:?})",
            pool_id, object_type, initial_capacity, growth_mode
        );
        pools.push(PoolEntry {
            type_id,
            init_param,
            any: pool.clone() as Arc<dyn Any + Send + Sync>,
            info: pool,
        });
        Ok(pool_id)
    }

    /// Typed handle to an existing pool.
    pub fn pool<T: Poolable>(&self, pool_id: PoolId) -> Result<Arc<SyncObjectPool<T>>> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let entry = pools
            .get(pool_id as usize)
            .ok_or(Error::BadPoolId(pool_id))?;
        entry
            .any
            .clone()
            .downcast::<SyncObjectPool<T>>()
            .map_err(|_| Error::BadPoolId(pool_id))
    }

    /// Reserve an object from a pool. Non-blocking reserves fail with
    /// [`Error::PoolExhausted`] when the pool lock is contended.
    pub fn reserve<T: Poolable>(&self, pool_id: PoolId, blocking: bool) -> Result<PooledObject<T>> {
        self.pool::<T>(pool_id)?.reserve(blocking)
    }

    /// Release an object back to the pool it came from.
    pub fn release<T: Poolable>(&self, object: PooledObject<T>) -> Result<()> {
        if !object.is_pooled() {
            warn!("release of an object that was not allocated through the OPM");
            return Err(Error::NotPooled);
        }
        self.pool::<T>(object.pool_id())?.release(object)
    }

    /// Whether this object came out of a pool.
    pub fn is_created_by_opm<T: Poolable>(&self, object: &PooledObject<T>) -> bool {
        object.is_pooled()
    }

    pub fn pool_stats(&self, pool_id: PoolId) -> Result<PoolStats> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .get(pool_id as usize)
            .map(|entry| entry.info.stats())
            .ok_or(Error::BadPoolId(pool_id))
    }

    /// Tear down every pool, logging a usage summary for each.
    ///
    /// Objects still held by guards are unaffected; with their pool gone
    /// they fall back to plain heap deallocation on drop.
    pub fn shutdown(&self) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        for entry in pools.iter() {
            let s = entry.info.stats();
            info!(
                "pool {} ({}): capacity {} (initial {}), used {}, peak {}, created {}, reserves {}, enlargements {}",
                s.pool_id,
                s.object_type,
                s.current_capacity,
                s.initial_capacity,
                s.used,
                s.peak_used,
                s.creation_count,
                s.total_reserved,
                s.enlargements
            );
            if s.used > 0 {
                warn!(
                    "pool {} shut down with {} objects still reserved",
                    s.pool_id, s.used
                );
            }
        }
        pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Frame(Vec<u8>);

    impl Poolable for Frame {
        fn new_instance(init_param: i64) -> Self {
            Self(Vec::with_capacity(init_param as usize))
        }

        fn clean(&mut self) {
            self.0.clear();
        }
    }

    struct Other;

    impl Poolable for Other {
        fn new_instance(_: i64) -> Self {
            Self
        }

        fn clean(&mut self) {}
    }

    #[test]
    fn create_pool_is_idempotent() {
        let opm = Opm::new();
        let a = opm
            .create_pool::<Frame>(64, 0.8, 4, 8, GrowthMode::GrowthAllowed)
            .unwrap();
        let b = opm
            .create_pool::<Frame>(64, 0.5, 2, 4, GrowthMode::NoGrowth)
            .unwrap();
        assert_eq!(a, b);

        // Different init param, different pool
        let c = opm
            .create_pool::<Frame>(128, 0.8, 4, 8, GrowthMode::GrowthAllowed)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn bad_pool_id_is_rejected() {
        let opm = Opm::new();
        assert!(matches!(opm.pool::<Frame>(3), Err(Error::BadPoolId(3))));

        let id = opm
            .create_pool::<Frame>(0, 0.8, 4, 8, GrowthMode::NoGrowth)
            .unwrap();
        // Right id, wrong type
        assert!(matches!(opm.pool::<Other>(id), Err(Error::BadPoolId(_))));
    }

    #[test]
    fn reserve_and_release_through_manager() {
        let opm = Opm::new();
        let id = opm
            .create_pool::<Frame>(16, 0.8, 4, 4, GrowthMode::NoGrowth)
            .unwrap();
        let mut frame = opm.reserve::<Frame>(id, true).unwrap();
        frame.0.extend_from_slice(b"abc");
        assert!(opm.is_created_by_opm(&frame));
        opm.release(frame).unwrap();
        assert_eq!(opm.pool_stats(id).unwrap().used, 0);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let opm = Opm::new();
        assert!(opm
            .create_pool::<Frame>(0, 0.8, 4, 0, GrowthMode::NoGrowth)
            .is_err());
        assert!(opm
            .create_pool::<Frame>(0, 1.5, 4, 8, GrowthMode::GrowthAllowed)
            .is_err());
        assert!(opm
            .create_pool::<Frame>(0, 0.8, 0, 8, GrowthMode::GrowthAllowed)
            .is_err());
    }
}
