use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::epoch::Guard;
use crate::node::Node;
use crate::stack::{Retired, Stack};
use crate::{debug_delay, Deferred};

/// Logical page identifier: an index into the [`MappingTable`].
pub(crate) type Pid = u64;

const L2_BITS: u32 = 14;
const L2_SIZE: usize = 1 << L2_BITS;
const L1_SIZE: usize = 1 << 12;
const L2_MASK: u64 = (1 << L2_BITS) - 1;

/// Largest number of ids a [`PageTable`] can hold.
pub(crate) const PAGE_TABLE_CAPACITY: u64 = (L1_SIZE * L2_SIZE) as u64;

/// A lock-free, lazily grown array indexed by `u64`.
///
/// Entries live in fixed chunks that are installed on first touch, so an
/// entry reference stays valid until the table itself is dropped.
pub(crate) struct PageTable<T: Default> {
    chunks: Box<[AtomicPtr<Box<[T]>>]>,
    _entries: PhantomData<Box<T>>,
}

impl<T: Default> Default for PageTable<T> {
    fn default() -> PageTable<T> {
        PageTable {
            chunks: (0..L1_SIZE).map(|_| AtomicPtr::default()).collect(),
            _entries: PhantomData,
        }
    }
}

impl<T: Default> Drop for PageTable<T> {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            let chunk_ptr = chunk.load(Ordering::Acquire);
            if !chunk_ptr.is_null() {
                drop(unsafe { Box::from_raw(chunk_ptr) });
            }
        }
    }
}

impl<T: Default> PageTable<T> {
    pub(crate) fn get(&self, id: u64) -> &T {
        assert!(
            id < PAGE_TABLE_CAPACITY,
            "id {id} exceeds the page table capacity of {PAGE_TABLE_CAPACITY}"
        );

        let chunk = self.chunk((id >> L2_BITS) as usize);
        &chunk[(id & L2_MASK) as usize]
    }

    fn chunk(&self, index: usize) -> &[T] {
        let slot = &self.chunks[index];
        let mut chunk_ptr = slot.load(Ordering::Acquire);

        if chunk_ptr.is_null() {
            let fresh: Box<[T]> = (0..L2_SIZE).map(|_| T::default()).collect();
            let fresh_ptr = Box::into_raw(Box::new(fresh));

            match slot.compare_exchange(
                ptr::null_mut(),
                fresh_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => chunk_ptr = fresh_ptr,
                Err(actual) => {
                    drop(unsafe { Box::from_raw(fresh_ptr) });
                    chunk_ptr = actual;
                }
            }
        }

        unsafe { &**chunk_ptr }
    }
}

/// Maps each [`Pid`] to the head of its delta chain. All structural
/// publication in the tree happens through [`MappingTable::install`].
pub(crate) struct MappingTable<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    table: PageTable<AtomicPtr<Node<K, V>>>,
    next_pid: AtomicU64,
    free_pids: Arc<Stack<Pid>>,
}

impl<K, V> MappingTable<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    pub(crate) fn new() -> MappingTable<K, V> {
        MappingTable {
            table: PageTable::default(),
            next_pid: AtomicU64::new(0),
            free_pids: Arc::default(),
        }
    }

    /// Current chain head for `pid`. Null means the page was retired.
    pub(crate) fn lookup(&self, pid: Pid) -> *mut Node<K, V> {
        self.table.get(pid).load(Ordering::Acquire)
    }

    /// Publishes `new` as the head of `pid` if the head is still
    /// `expected`. On failure the actual head is returned.
    pub(crate) fn install(
        &self,
        pid: Pid,
        expected: *mut Node<K, V>,
        new: *mut Node<K, V>,
    ) -> Result<(), *mut Node<K, V>> {
        if debug_delay() {
            return Err(self.lookup(pid));
        }

        self.table
            .get(pid)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Assigns a page id to a node that is not yet reachable from any
    /// other page. Recycled ids are preferred over fresh ones.
    pub(crate) fn allocate(&self, node: Box<Node<K, V>>, guard: &Guard<'_, Deferred<K, V>>) -> Pid {
        let pid = match self.free_pids.pop(guard) {
            Some(pid) => pid,
            None => self.next_pid.fetch_add(1, Ordering::AcqRel),
        };
        self.store_fresh(pid, node);
        pid
    }

    /// Like [`MappingTable::allocate`], without recycling. Used while the
    /// tree is built, before any guard exists.
    pub(crate) fn allocate_fresh(&self, node: Box<Node<K, V>>) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::AcqRel);
        self.store_fresh(pid, node);
        pid
    }

    fn store_fresh(&self, pid: Pid, node: Box<Node<K, V>>) {
        let previous = self.table.get(pid).swap(Box::into_raw(node), Ordering::AcqRel);
        assert!(previous.is_null(), "allocated pid {pid} was still in use");
    }

    /// Takes back a page that was allocated but never linked into the
    /// tree. Nobody else can know about it, so both the node and the id
    /// are released immediately.
    pub(crate) fn release_unpublished(&self, pid: Pid) {
        let node_ptr = self.table.get(pid).swap(ptr::null_mut(), Ordering::AcqRel);
        if !node_ptr.is_null() {
            drop(unsafe { Box::from_raw(node_ptr) });
        }
        self.free_pids.push(pid);
    }

    /// Nulls the slot of a retired page. The chain and the id must then be
    /// handed to the collector by the caller.
    pub(crate) fn clear(&self, pid: Pid, expected: *mut Node<K, V>) -> bool {
        self.table
            .get(pid)
            .compare_exchange(expected, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Builds the deferred action that recycles `pid` once the epoch that
    /// retired it has passed.
    pub(crate) fn deferred_release(&self, pid: Pid) -> Deferred<K, V> {
        Deferred::Pid {
            pid,
            free_pids: self.free_pids.clone(),
        }
    }

    /// One past the largest pid ever handed out.
    pub(crate) fn high_water(&self) -> Pid {
        self.next_pid.load(Ordering::Acquire)
    }

    /// Detaches and returns every remaining chain head. Only valid once no
    /// other thread can access the table.
    pub(crate) fn drain(&mut self) -> Vec<*mut Node<K, V>> {
        (0..self.high_water())
            .map(|pid| self.table.get(pid).swap(ptr::null_mut(), Ordering::AcqRel))
            .filter(|head| !head.is_null())
            .collect()
    }
}

impl<K, V> From<Retired<Pid>> for Deferred<K, V>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn from(retired: Retired<Pid>) -> Deferred<K, V> {
        Deferred::FreeListCell(retired)
    }
}

#[test]
fn page_table_grows_lazily() {
    let table = PageTable::<AtomicU64>::default();
    table.get(3).store(3, Ordering::Relaxed);
    table.get(L2_SIZE as u64 + 7).store(7, Ordering::Relaxed);

    assert_eq!(table.get(3).load(Ordering::Relaxed), 3);
    assert_eq!(table.get(L2_SIZE as u64 + 7).load(Ordering::Relaxed), 7);
    assert_eq!(table.get(PAGE_TABLE_CAPACITY - 1).load(Ordering::Relaxed), 0);

    let installed = table
        .chunks
        .iter()
        .filter(|chunk| !chunk.load(Ordering::Relaxed).is_null())
        .count();
    assert_eq!(installed, 3);
}

#[test]
#[should_panic(expected = "exceeds the page table capacity")]
fn page_table_rejects_out_of_range_ids() {
    let table = PageTable::<AtomicU64>::default();
    table.get(PAGE_TABLE_CAPACITY);
}
