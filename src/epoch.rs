//! Epoch-based reclamation keyed by explicitly assigned garbage collection
//! ids.
//!
//! Every participating thread owns one [`Slot`]. While an operation runs,
//! the slot holds the global epoch observed when the operation started; in
//! between operations it holds [`INACTIVE`]. Retired items are buffered
//! locally, then sealed into a bag tagged with the epoch current at sealing
//! time. A bag is released once every active slot holds a strictly greater
//! epoch, because any thread that could still reach its contents started
//! before the items were unlinked.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::mapping_table::PageTable;

/// Value of a slot whose thread is between operations.
pub(crate) const INACTIVE: u64 = u64::MAX;

#[repr(align(64))]
#[derive(Debug)]
pub(crate) struct Slot {
    epoch: AtomicU64,
    registered: AtomicBool,
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            epoch: AtomicU64::new(INACTIVE),
            registered: AtomicBool::new(false),
        }
    }
}

struct Bag<T> {
    epoch: u64,
    items: Vec<T>,
    next: *mut Bag<T>,
}

pub(crate) struct Collector<T: Send> {
    epoch: AtomicU64,
    slots: PageTable<Slot>,
    capacity: AtomicUsize,
    high_water: AtomicUsize,
    bags: AtomicPtr<Bag<T>>,
    pending: AtomicUsize,
    threshold: usize,
    epochs_advanced: AtomicU64,
    reclaimed: AtomicU64,
    _items: PhantomData<T>,
}

unsafe impl<T: Send> Send for Collector<T> {}
unsafe impl<T: Send> Sync for Collector<T> {}

impl<T: Send> Drop for Collector<T> {
    fn drop(&mut self) {
        let mut cursor = self.bags.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            let bag = unsafe { Box::from_raw(cursor) };
            cursor = bag.next;
        }
    }
}

impl<T: Send> Collector<T> {
    pub(crate) fn new(capacity: usize, threshold: usize) -> Collector<T> {
        Collector {
            epoch: AtomicU64::new(0),
            slots: PageTable::default(),
            capacity: AtomicUsize::new(capacity),
            high_water: AtomicUsize::new(0),
            bags: AtomicPtr::default(),
            pending: AtomicUsize::new(0),
            threshold,
            epochs_advanced: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            _items: PhantomData,
        }
    }

    fn slot(&self, id: usize) -> &Slot {
        self.slots.get(id as u64)
    }

    /// Claims slot `id` for the calling thread and stamps it with the
    /// current epoch.
    pub(crate) fn register(&self, id: usize) {
        let capacity = self.capacity.load(Ordering::Acquire);
        assert!(
            id < capacity,
            "gc id {id} is outside of the {capacity} slots reserved by update_thread_local"
        );

        let slot = self.slot(id);
        if slot
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("gc id {id} is already registered");
        }

        slot.epoch
            .store(self.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        self.high_water.fetch_max(id + 1, Ordering::AcqRel);

        log::trace!("registered gc id {id}");
    }

    pub(crate) fn unregister(&self, id: usize) {
        let slot = self.slot(id);
        slot.epoch.store(INACTIVE, Ordering::SeqCst);
        let was_registered = slot.registered.swap(false, Ordering::AcqRel);
        assert!(was_registered, "gc id {id} was not registered");

        log::trace!("unregistered gc id {id}");
    }

    /// Changes the number of slots that [`Collector::register`] accepts.
    /// Shrinking past a registered slot is a contract violation.
    pub(crate) fn resize(&self, capacity: usize) {
        let high_water = self.high_water.load(Ordering::Acquire);
        for id in capacity..high_water {
            assert!(
                !self.slot(id).registered.load(Ordering::Acquire),
                "cannot shrink gc slots to {capacity} while gc id {id} is registered"
            );
        }
        self.capacity.store(capacity, Ordering::Release);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of currently registered slots.
    pub(crate) fn registered(&self) -> usize {
        let high_water = self.high_water.load(Ordering::Acquire);
        (0..high_water)
            .filter(|id| self.slot(*id).registered.load(Ordering::Acquire))
            .count()
    }

    /// Number of retired items sealed into bags that are not yet released.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn epochs_advanced(&self) -> u64 {
        self.epochs_advanced.load(Ordering::Relaxed)
    }

    pub(crate) fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Marks slot `id` active for the lifetime of the returned guard.
    ///
    /// Guards must not be nested on the same slot: the inner guard's drop
    /// would mark the slot inactive while the outer one is still in use.
    pub(crate) fn pin<'a>(
        &'a self,
        id: usize,
        local: &'a RefCell<Vec<T>>,
        local_capacity: usize,
    ) -> Guard<'a, T> {
        let slot = self.slot(id);
        debug_assert!(
            slot.registered.load(Ordering::Relaxed),
            "pinned unregistered gc id {id}"
        );

        let epoch = self.epoch.load(Ordering::SeqCst);
        slot.epoch.store(epoch, Ordering::SeqCst);
        // the stamp must be visible before any shared pointer is loaded
        fence(Ordering::SeqCst);

        Guard {
            collector: self,
            slot,
            local,
            local_capacity: local_capacity.max(1),
        }
    }

    /// Moves a thread's buffered garbage into a bag tagged with the
    /// current epoch, returning how many sealed items are now pending.
    pub(crate) fn seal(&self, items: Vec<T>) -> usize {
        if items.is_empty() {
            return self.pending();
        }

        // order every unlink this thread performed before reading the tag
        fence(Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let count = items.len();

        let bag = Box::into_raw(Box::new(Bag {
            epoch,
            items,
            next: ptr::null_mut(),
        }));
        self.push_bags(bag, bag);

        self.pending.fetch_add(count, Ordering::AcqRel) + count
    }

    fn push_bags(&self, first: *mut Bag<T>, last: *mut Bag<T>) {
        let mut head = self.bags.load(Ordering::Acquire);
        loop {
            unsafe {
                (*last).next = head;
            }
            match self
                .bags
                .compare_exchange(head, first, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn min_active_epoch(&self) -> u64 {
        let high_water = self.high_water.load(Ordering::Acquire);
        (0..high_water)
            .map(|id| self.slot(id).epoch.load(Ordering::SeqCst))
            .min()
            .unwrap_or(INACTIVE)
    }

    /// Advances the global epoch and drops every sealed bag whose tag is
    /// older than all active slots. Returns the number of items released.
    pub(crate) fn try_reclaim(&self) -> usize {
        // only bags sealed before the slot scan below may be judged by it
        let mut cursor = self.bags.swap(ptr::null_mut(), Ordering::SeqCst);

        let previous = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.epochs_advanced.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let min_active = self.min_active_epoch();

        let mut survivors: (*mut Bag<T>, *mut Bag<T>) = (ptr::null_mut(), ptr::null_mut());
        let mut released = vec![];

        while !cursor.is_null() {
            let mut bag = unsafe { Box::from_raw(cursor) };
            cursor = mem::replace(&mut bag.next, ptr::null_mut());

            if bag.epoch < min_active {
                released.push(bag);
            } else {
                let bag_ptr = Box::into_raw(bag);
                if survivors.0.is_null() {
                    survivors = (bag_ptr, bag_ptr);
                } else {
                    unsafe {
                        (*survivors.1).next = bag_ptr;
                    }
                    survivors.1 = bag_ptr;
                }
            }
        }

        if !survivors.0.is_null() {
            self.push_bags(survivors.0, survivors.1);
        }

        let count: usize = released.iter().map(|bag| bag.items.len()).sum();
        self.pending.fetch_sub(count, Ordering::AcqRel);
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);

        log::debug!(
            "advanced epoch to {}, released {} items older than {}",
            previous + 1,
            count,
            min_active
        );

        // dropping the items may touch other shared structures, so it
        // happens after the survivors are visible again
        drop(released);

        count
    }
}

/// Keeps a slot stamped with the epoch that was current when it was
/// created.
pub(crate) struct Guard<'a, T: Send> {
    collector: &'a Collector<T>,
    slot: &'a Slot,
    local: &'a RefCell<Vec<T>>,
    local_capacity: usize,
}

impl<'a, T: Send> Drop for Guard<'a, T> {
    fn drop(&mut self) {
        self.slot.epoch.store(INACTIVE, Ordering::Release);
    }
}

impl<'a, T: Send> Guard<'a, T> {
    /// Hands an unlinked item to the collector. It is dropped once no
    /// thread that might still observe it remains active.
    pub(crate) fn defer(&self, item: T) {
        let mut local = self.local.borrow_mut();
        local.push(item);

        if local.len() < self.local_capacity {
            return;
        }

        let items = mem::replace(&mut *local, Vec::with_capacity(self.local_capacity));
        drop(local);

        if self.collector.seal(items) >= self.collector.threshold {
            self.collector.try_reclaim();
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Collector, INACTIVE};

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn active_slot_blocks_reclamation() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let collector = Collector::<Tracked>::new(2, usize::MAX);
        collector.register(0);
        collector.register(1);

        let reader_local = RefCell::new(vec![]);
        let writer_local = RefCell::new(vec![]);

        let reader = collector.pin(1, &reader_local, 64);

        {
            let writer = collector.pin(0, &writer_local, 64);
            writer.defer(Tracked(dropped.clone()));
        }
        collector.seal(writer_local.take());

        assert_eq!(collector.try_reclaim(), 0);
        assert_eq!(collector.pending(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        drop(reader);

        assert_eq!(collector.try_reclaim(), 1);
        assert_eq!(collector.pending(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(collector.epochs_advanced(), 2);
        assert_eq!(collector.reclaimed(), 1);

        collector.unregister(0);
        collector.unregister(1);
        assert_eq!(collector.registered(), 0);
    }

    #[test]
    fn full_local_buffer_is_sealed() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let collector = Collector::<Tracked>::new(1, 4);
        collector.register(0);
        let local = RefCell::new(vec![]);

        for _ in 0..3 {
            let guard = collector.pin(0, &local, 2);
            guard.defer(Tracked(dropped.clone()));
            guard.defer(Tracked(dropped.clone()));
        }

        // the third seal crossed the threshold while its own slot was still
        // stamped, so only bags tagged before that stamp were released
        assert!(local.borrow().is_empty());
        assert_eq!(
            dropped.load(Ordering::SeqCst) + collector.pending(),
            6,
            "every retired item is either dropped or pending"
        );

        collector.unregister(0);
        collector.try_reclaim();
        assert_eq!(dropped.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn dropping_the_collector_releases_pending_bags() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let collector = Collector::<Tracked>::new(1, usize::MAX);
        collector.seal(vec![Tracked(dropped.clone()), Tracked(dropped.clone())]);
        assert_eq!(collector.pending(), 2);
        drop(collector);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registration_stamps_and_unpin_clears() {
        let collector = Collector::<()>::new(1, 1);
        collector.register(0);
        assert_eq!(collector.min_active_epoch(), collector.epoch());

        let local = RefCell::new(vec![]);
        drop(collector.pin(0, &local, 1));
        assert_eq!(collector.min_active_epoch(), INACTIVE);
        collector.unregister(0);
    }

    struct Canary {
        retired: AtomicBool,
    }

    struct Retire(Arc<Canary>);

    impl Drop for Retire {
        fn drop(&mut self) {
            self.0.retired.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn unpinned_reclaimer_never_frees_what_a_reader_holds() {
        const SWAPS: usize = 20_000;
        // a wide slot table makes the scan slow enough for seals to race it
        const SLOTS: usize = 4096;

        let collector = Collector::<Retire>::new(SLOTS, usize::MAX);
        collector.register(SLOTS - 1);
        collector.unregister(SLOTS - 1);
        collector.register(0);
        collector.register(1);

        let first = Arc::new(Canary {
            retired: AtomicBool::new(false),
        });
        let shared = AtomicPtr::new(Arc::as_ptr(&first) as *mut Canary);
        let done = AtomicBool::new(false);
        let violations = AtomicUsize::new(0);

        let kept = std::thread::scope(|s| {
            s.spawn(|| {
                let local = RefCell::new(vec![]);
                while !done.load(Ordering::Acquire) {
                    let guard = collector.pin(0, &local, 1);
                    let canary = unsafe { &*shared.load(Ordering::SeqCst) };
                    if canary.retired.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    drop(guard);
                }
            });

            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    collector.try_reclaim();
                }
            });

            let writer = s.spawn(|| {
                let local = RefCell::new(vec![]);
                let mut current = first.clone();
                // keeps every canary allocated so retired ones stay readable
                let mut kept = vec![first.clone()];

                for _ in 0..SWAPS {
                    let next = Arc::new(Canary {
                        retired: AtomicBool::new(false),
                    });
                    kept.push(next.clone());

                    let guard = collector.pin(1, &local, 1);
                    shared.store(Arc::as_ptr(&next) as *mut Canary, Ordering::SeqCst);
                    guard.defer(Retire(std::mem::replace(&mut current, next)));
                }

                done.store(true, Ordering::Release);
                kept
            });

            writer.join().unwrap()
        });

        assert_eq!(violations.load(Ordering::SeqCst), 0);

        collector.unregister(0);
        collector.unregister(1);
        collector.try_reclaim();
        assert!(kept[..SWAPS].iter().all(|canary| canary.retired.load(Ordering::SeqCst)));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_panics() {
        let collector = Collector::<()>::new(2, 1);
        collector.register(1);
        collector.register(1);
    }

    #[test]
    #[should_panic(expected = "outside of the 1 slots")]
    fn registration_beyond_capacity_panics() {
        let collector = Collector::<()>::new(1, 1);
        collector.register(1);
    }

    #[test]
    #[should_panic(expected = "while gc id 3 is registered")]
    fn shrinking_below_a_registered_slot_panics() {
        let collector = Collector::<()>::new(4, 1);
        collector.register(3);
        collector.resize(2);
    }
}
