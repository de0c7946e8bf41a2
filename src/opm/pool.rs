//! Reusable-object pools with threshold growth and historical shrink

use crate::error::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use tracing::{debug, warn};

/// Identifies a pool within one [`Opm`](crate::opm::Opm) instance.
pub type PoolId = u32;

/// Sentinel carried by objects that were never allocated through a pool.
pub const UNKNOWN_POOL_ID: PoolId = PoolId::MAX;

pub const DEFAULT_THRESHOLD_PERCENTAGE: f64 = 0.8;
pub const DEFAULT_CAPACITY_INCREMENT: usize = 10;

/// Resize policy for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthMode {
    /// Fixed capacity; an empty free list fails the reserve
    NoGrowth,
    /// Capacity grows past the usage threshold and never comes back
    GrowthAllowed,
    /// Capacity grows past the threshold and shrinks back through the
    /// recorded capacity history as usage drains
    GrowAndShrink,
}

/// An object that can live in a pool.
///
/// `new_instance` is the bootstrap constructor invoked for the initial fill
/// and for every growth increment; `clean` restores the object to its
/// just-constructed state before it re-enters the free list.
pub trait Poolable: Send + 'static {
    fn new_instance(init_param: i64) -> Self
    where
        Self: Sized;

    fn clean(&mut self);
}

/// Point-in-time counters for one pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub object_type: &'static str,
    pub growth_mode: GrowthMode,
    pub initial_capacity: usize,
    pub current_capacity: usize,
    pub capacity_increment: usize,
    pub threshold_percentage: f64,
    pub used: usize,
    pub free: usize,
    pub peak_used: usize,
    pub creation_count: u64,
    pub total_reserved: u64,
    pub enlargements: usize,
}

/// Growth/shrink engine. Not synchronized; [`SyncObjectPool`] wraps it.
///
/// The free list is a stack of owned boxes. Reserved objects leave the pool
/// entirely (ownership moves into the [`PooledObject`] guard), so the used
/// side is a counter rather than a second list; `free.len() + used` always
/// equals `current_capacity` at rest.
pub(crate) struct ObjectPool<T: Poolable> {
    pool_id: PoolId,
    object_type: &'static str,
    init_param: i64,
    growth_mode: GrowthMode,
    initial_capacity: usize,
    capacity_increment: usize,
    threshold_percentage: f64,
    /// `initial_capacity - initial_capacity * threshold`; the headroom kept
    /// at every capacity level
    initial_threshold: usize,
    free: Vec<Box<T>>,
    used: usize,
    current_capacity: usize,
    peak_used: usize,
    creation_count: u64,
    total_reserved: u64,
    enlargements: usize,
    /// Usage level that re-arms the next shrink, if a growth has happened
    previous_threshold: Option<usize>,
    /// `capacity_history[i]` is the capacity after `i` enlargements
    capacity_history: Vec<usize>,
}

impl<T: Poolable> ObjectPool<T> {
    pub(crate) fn new(
        pool_id: PoolId,
        object_type: &'static str,
        init_param: i64,
        threshold_percentage: f64,
        capacity_increment: usize,
        initial_capacity: usize,
        growth_mode: GrowthMode,
    ) -> Self {
        let initial_threshold = if growth_mode == GrowthMode::NoGrowth {
            0
        } else {
            initial_capacity - (initial_capacity as f64 * threshold_percentage) as usize
        };

        let mut free = Vec::with_capacity(initial_capacity);
        for _ in 0..initial_capacity {
            free.push(Box::new(T::new_instance(init_param)));
        }

        debug!(
            "pool {} created: {} x{} ({:?})",
            pool_id, object_type, initial_capacity, growth_mode
        );

        Self {
            pool_id,
            object_type,
            init_param,
            growth_mode,
            initial_capacity,
            capacity_increment,
            threshold_percentage,
            initial_threshold,
            free,
            used: 0,
            current_capacity: initial_capacity,
            peak_used: 0,
            creation_count: initial_capacity as u64,
            total_reserved: 0,
            enlargements: 0,
            previous_threshold: None,
            capacity_history: vec![initial_capacity],
        }
    }

    fn reserve(&mut self) -> Result<Box<T>> {
        if self.free.is_empty() {
            warn!("pool {} has no free {} objects", self.pool_id, self.object_type);
            return Err(Error::PoolExhausted(self.pool_id));
        }

        if self.growth_mode != GrowthMode::NoGrowth
            && self.used > self.current_capacity - self.initial_threshold
        {
            self.grow();
        } else if self.used == self.current_capacity - 1 {
            warn!(
                "pool {} max usage ({}) reached for {} objects",
                self.pool_id, self.current_capacity, self.object_type
            );
        }

        // Free list is non-empty here: either it was non-empty on entry or
        // grow() just refilled it
        let object = match self.free.pop() {
            Some(object) => object,
            None => return Err(Error::PoolExhausted(self.pool_id)),
        };

        self.used += 1;
        if self.used > self.peak_used {
            self.peak_used = self.used;
            debug!(
                "pool {} peak usage now {} {}",
                self.pool_id, self.peak_used, self.object_type
            );
        }
        self.total_reserved += 1;
        Ok(object)
    }

    fn release(&mut self, mut object: Box<T>) {
        self.used -= 1;
        object.clean();
        self.free.push(object);

        if self.growth_mode == GrowthMode::GrowAndShrink
            && self
                .previous_threshold
                .is_some_and(|threshold| self.used < threshold)
        {
            self.shrink();
        }
    }

    fn grow(&mut self) {
        self.enlargements += 1;
        self.previous_threshold = Some(self.current_capacity - self.initial_threshold);

        for _ in 0..self.capacity_increment {
            self.free.push(Box::new(T::new_instance(self.init_param)));
        }
        self.current_capacity += self.capacity_increment;
        self.creation_count += self.capacity_increment as u64;

        if self.enlargements < self.capacity_history.len() {
            self.capacity_history[self.enlargements] = self.current_capacity;
        } else {
            self.capacity_history.push(self.current_capacity);
        }

        debug!(
            "pool {} grew to {} objects ({} enlargements over initial capacity)",
            self.pool_id, self.current_capacity, self.enlargements
        );
    }

    fn shrink(&mut self) {
        if self.enlargements == 0 {
            return;
        }
        self.enlargements -= 1;
        let new_capacity = self.capacity_history[self.enlargements];

        self.previous_threshold = if self.enlargements > 0 {
            Some(self.capacity_history[self.enlargements - 1] - self.initial_threshold)
        } else {
            None
        };

        let surplus = (self.current_capacity - new_capacity).min(self.free.len());
        self.free.truncate(self.free.len() - surplus);
        self.current_capacity -= surplus;

        debug!(
            "pool {} shrank to {} objects ({} enlargements remain)",
            self.pool_id, self.current_capacity, self.enlargements
        );
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            pool_id: self.pool_id,
            object_type: self.object_type,
            growth_mode: self.growth_mode,
            initial_capacity: self.initial_capacity,
            current_capacity: self.current_capacity,
            capacity_increment: self.capacity_increment,
            threshold_percentage: self.threshold_percentage,
            used: self.used,
            free: self.free.len(),
            peak_used: self.peak_used,
            creation_count: self.creation_count,
            total_reserved: self.total_reserved,
            enlargements: self.enlargements,
        }
    }
}

/// Thread-safe pool handed out by the manager.
///
/// Serializes reserve/release/stats under one mutex; the non-blocking
/// reserve uses `try_lock` and reports exhaustion instead of queueing.
pub struct SyncObjectPool<T: Poolable> {
    pool_id: PoolId,
    inner: Mutex<ObjectPool<T>>,
}

impl<T: Poolable> SyncObjectPool<T> {
    pub(crate) fn new(
        pool_id: PoolId,
        object_type: &'static str,
        init_param: i64,
        threshold_percentage: f64,
        capacity_increment: usize,
        initial_capacity: usize,
        growth_mode: GrowthMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool_id,
            inner: Mutex::new(ObjectPool::new(
                pool_id,
                object_type,
                init_param,
                threshold_percentage,
                capacity_increment,
                initial_capacity,
                growth_mode,
            )),
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Reserve an object. With `blocking = false` a contended pool lock
    /// fails the reserve instead of waiting.
    pub fn reserve(self: &Arc<Self>, blocking: bool) -> Result<PooledObject<T>> {
        let mut inner = if blocking {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        } else {
            match self.inner.try_lock() {
                Ok(inner) => inner,
                Err(TryLockError::WouldBlock) => return Err(Error::PoolExhausted(self.pool_id)),
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
            }
        };
        let object = inner.reserve()?;
        Ok(PooledObject {
            object: Some(object),
            pool_id: self.pool_id,
            home: Arc::downgrade(self),
        })
    }

    /// Explicitly release an object back into this pool, validating that it
    /// actually belongs here.
    pub fn release(&self, mut object: PooledObject<T>) -> Result<()> {
        if object.pool_id == UNKNOWN_POOL_ID {
            warn!("release of a non-pooled object refused by pool {}", self.pool_id);
            object.home = Weak::new();
            return Err(Error::NotPooled);
        }
        if object.pool_id != self.pool_id {
            warn!(
                "release of an object from pool {} refused by pool {}",
                object.pool_id, self.pool_id
            );
            // The guard still knows its home pool; dropping it returns the
            // object there rather than corrupting this pool
            return Err(Error::WrongPool {
                expected: self.pool_id,
                actual: object.pool_id,
            });
        }
        if let Some(boxed) = object.object.take() {
            self.release_boxed(boxed);
        }
        Ok(())
    }

    pub(crate) fn release_boxed(&self, object: Box<T>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(object);
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free
            .is_empty()
    }
}

/// Owning guard around a reserved object.
///
/// Dropping the guard returns the object to its pool (if the pool is still
/// alive) after the pool runs the object's `clean` hook. Objects created
/// with [`PooledObject::detached`] carry [`UNKNOWN_POOL_ID`] and are plain
/// heap allocations.
pub struct PooledObject<T: Poolable> {
    object: Option<Box<T>>,
    pool_id: PoolId,
    home: Weak<SyncObjectPool<T>>,
}

impl<T: Poolable> PooledObject<T> {
    /// Wrap a heap object that does not belong to any pool.
    pub fn detached(value: T) -> Self {
        Self {
            object: Some(Box::new(value)),
            pool_id: UNKNOWN_POOL_ID,
            home: Weak::new(),
        }
    }

    /// Pool this object was reserved from, or [`UNKNOWN_POOL_ID`].
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn is_pooled(&self) -> bool {
        self.pool_id != UNKNOWN_POOL_ID
    }
}

impl<T: Poolable> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object already consumed")
    }
}

impl<T: Poolable> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object already consumed")
    }
}

impl<T: Poolable> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take()
            && let Some(pool) = self.home.upgrade()
        {
            pool.release_boxed(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget {
        tag: i64,
        dirty: bool,
    }

    impl Poolable for Widget {
        fn new_instance(init_param: i64) -> Self {
            Self { tag: init_param, dirty: false }
        }

        fn clean(&mut self) {
            self.dirty = false;
        }
    }

    fn pool(initial: usize, mode: GrowthMode) -> Arc<SyncObjectPool<Widget>> {
        SyncObjectPool::new(0, "Widget", 7, 0.8, 10, initial, mode)
    }

    #[test]
    fn reserve_release_is_identity() {
        let p = pool(10, GrowthMode::GrowthAllowed);
        let before = p.stats();
        let w = p.reserve(true).unwrap();
        assert_eq!(w.tag, 7);
        p.release(w).unwrap();
        let after = p.stats();
        assert_eq!(before.free, after.free);
        assert_eq!(before.used, after.used);
        assert_eq!(after.free + after.used, after.current_capacity);
    }

    #[test]
    fn growth_triggers_past_threshold() {
        let p = pool(10, GrowthMode::GrowthAllowed);
        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(p.reserve(true).unwrap());
        }
        assert_eq!(p.stats().current_capacity, 10);
        held.push(p.reserve(true).unwrap());
        assert_eq!(p.stats().current_capacity, 20);
        assert_eq!(p.stats().creation_count, 20);
    }

    #[test]
    fn shrink_returns_to_historical_capacity() {
        let p = pool(10, GrowthMode::GrowAndShrink);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(p.reserve(true).unwrap());
        }
        assert_eq!(p.stats().current_capacity, 20);
        while let Some(w) = held.pop() {
            p.release(w).unwrap();
        }
        let stats = p.stats();
        assert_eq!(stats.current_capacity, 10);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, 10);
        assert_eq!(stats.peak_used, 10);
    }

    #[test]
    fn no_growth_pool_exhausts() {
        let p = pool(2, GrowthMode::NoGrowth);
        let a = p.reserve(true).unwrap();
        let _b = p.reserve(true).unwrap();
        assert!(matches!(p.reserve(true), Err(Error::PoolExhausted(0))));
        p.release(a).unwrap();
        assert!(p.reserve(true).is_ok());
    }

    #[test]
    fn wrong_pool_release_is_refused() {
        let p = pool(2, GrowthMode::NoGrowth);
        let other = SyncObjectPool::<Widget>::new(1, "Widget", 0, 0.8, 10, 2, GrowthMode::NoGrowth);
        let w = p.reserve(true).unwrap();
        assert!(matches!(
            other.release(w),
            Err(Error::WrongPool { expected: 1, actual: 0 })
        ));
        // The drop path sent the object back to its own pool
        assert_eq!(p.stats().used, 0);
        assert_eq!(p.stats().free, 2);
    }

    #[test]
    fn detached_object_release_is_refused() {
        let p = pool(2, GrowthMode::NoGrowth);
        let loose = PooledObject::detached(Widget { tag: 0, dirty: false });
        assert!(!loose.is_pooled());
        assert!(matches!(p.release(loose), Err(Error::NotPooled)));
        assert_eq!(p.stats().free, 2);
    }

    #[test]
    fn clean_runs_on_release() {
        let p = pool(1, GrowthMode::NoGrowth);
        let mut w = p.reserve(true).unwrap();
        w.dirty = true;
        p.release(w).unwrap();
        let w = p.reserve(true).unwrap();
        assert!(!w.dirty);
    }
}
