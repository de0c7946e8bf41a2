//! Object Pool Manager scenario tests

use postbus::{Error, GrowthMode, Opm, Poolable};

struct Envelope {
    slot: Vec<u8>,
}

impl Poolable for Envelope {
    fn new_instance(init_param: i64) -> Self {
        Self { slot: Vec::with_capacity(init_param as usize) }
    }

    fn clean(&mut self) {
        self.slot.clear();
    }
}

#[test]
fn growth_and_shrink_cycle() {
    let opm = Opm::new();
    let id = opm
        .create_pool::<Envelope>(64, 0.8, 10, 10, GrowthMode::GrowAndShrink)
        .unwrap();

    // Nine reserves ride the initial capacity
    let mut held = Vec::new();
    for _ in 0..9 {
        held.push(opm.reserve::<Envelope>(id, true).unwrap());
    }
    assert_eq!(opm.pool_stats(id).unwrap().current_capacity, 10);

    // The tenth crosses the threshold and grows the pool by one increment
    held.push(opm.reserve::<Envelope>(id, true).unwrap());
    let stats = opm.pool_stats(id).unwrap();
    assert_eq!(stats.current_capacity, 20);
    assert_eq!(stats.creation_count, 20);
    assert_eq!(stats.peak_used, 10);

    // Draining shrinks capacity back to the previous historical level and
    // deletes the surplus objects
    while let Some(envelope) = held.pop() {
        opm.release(envelope).unwrap();
    }
    let stats = opm.pool_stats(id).unwrap();
    assert_eq!(stats.current_capacity, 10);
    assert_eq!(stats.free, 10);
    assert_eq!(stats.used, 0);
    assert_eq!(stats.peak_used, 10);
    assert_eq!(stats.creation_count, 20);
}

#[test]
fn reserve_release_leaves_counts_unchanged() {
    let opm = Opm::new();
    let id = opm
        .create_pool::<Envelope>(0, 0.8, 4, 8, GrowthMode::GrowthAllowed)
        .unwrap();

    let before = opm.pool_stats(id).unwrap();
    let envelope = opm.reserve::<Envelope>(id, true).unwrap();
    opm.release(envelope).unwrap();
    let after = opm.pool_stats(id).unwrap();

    assert_eq!(before.free, after.free);
    assert_eq!(before.used, after.used);
    assert_eq!(after.free + after.used, after.current_capacity);
}

#[test]
fn create_pool_is_idempotent_per_type_and_param() {
    let opm = Opm::new();
    let a = opm
        .create_pool::<Envelope>(64, 0.8, 10, 10, GrowthMode::NoGrowth)
        .unwrap();
    let b = opm
        .create_pool::<Envelope>(64, 0.9, 5, 20, GrowthMode::GrowAndShrink)
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn exhausted_fixed_pool_fails_reserve() {
    let opm = Opm::new();
    let id = opm
        .create_pool::<Envelope>(0, 0.8, 4, 2, GrowthMode::NoGrowth)
        .unwrap();

    let _a = opm.reserve::<Envelope>(id, true).unwrap();
    let _b = opm.reserve::<Envelope>(id, true).unwrap();
    assert!(matches!(
        opm.reserve::<Envelope>(id, true),
        Err(Error::PoolExhausted(_))
    ));
}

#[test]
fn release_through_the_wrong_manager_entry_is_refused() {
    let opm = Opm::new();
    let with_param = opm
        .create_pool::<Envelope>(16, 0.8, 4, 2, GrowthMode::NoGrowth)
        .unwrap();
    let other = opm
        .create_pool::<Envelope>(32, 0.8, 4, 2, GrowthMode::NoGrowth)
        .unwrap();

    let envelope = opm.reserve::<Envelope>(with_param, true).unwrap();
    let pool = opm.pool::<Envelope>(other).unwrap();
    assert!(matches!(pool.release(envelope), Err(Error::WrongPool { .. })));

    // The object found its way home through the guard's drop path
    assert_eq!(opm.pool_stats(with_param).unwrap().used, 0);
}

#[test]
fn shutdown_reports_and_clears_pools() {
    let opm = Opm::new();
    let id = opm
        .create_pool::<Envelope>(0, 0.8, 4, 4, GrowthMode::NoGrowth)
        .unwrap();
    let held = opm.reserve::<Envelope>(id, true).unwrap();

    opm.shutdown();
    assert!(matches!(opm.pool_stats(id), Err(Error::BadPoolId(_))));

    // Outstanding guards survive shutdown; they fall back to heap drop
    drop(held);
}
