#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        trivial_casts,
    )
)]
#![cfg_attr(test, deny(
    clippy::cast_lossless,
    clippy::doc_markdown,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::filter_map_next,
    clippy::get_unwrap,
    clippy::if_not_else,
    clippy::inline_always,
    clippy::manual_find_map,
    clippy::map_entry,
    clippy::map_flatten,
    clippy::match_like_matches_macro,
    clippy::mem_forget,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::redundant_closure_for_method_calls,
    clippy::string_add,
    clippy::unimplemented,
    clippy::wildcard_dependencies,
))]

//! A latch-free Bw-tree: an ordered multimap from keys to sets of values
//! that never blocks on a lock.
//!
//! Pages are addressed indirectly through a mapping table of page ids. A
//! page is an immutable chain of delta records ending in a base record,
//! and every modification publishes a new chain head with a single
//! compare-and-swap on the page's slot. Long chains are consolidated into
//! a fresh base record, and pages are split or merged through multi-step
//! structure modifications that any thread can complete.
//!
//! Replaced chains are reclaimed through epochs. Every thread that works
//! on a tree identifies itself with a garbage collection id:
//!
//! * [`BwTree::update_thread_local`] sizes the table of per-thread slots,
//! * [`BwTree::assign_gc_id`] registers the calling handle,
//! * [`BwTree::unregister_thread`] releases the slot again.
//!
//! Keys must implement the [`Minimum`] trait, which provides the lower
//! bound of the leftmost page before anything is inserted.

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// our atomic operations, shaking out more possible
/// interleavings quickly. It gets fully eliminated by the
/// compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=98 => false,
        _ => {
            std::thread::yield_now();
            true
        }
    }
}

mod config;
mod epoch;
mod mapping_table;
mod node;
mod smo;
mod stack;
mod stats;
mod tree;

pub use config::{Backoff, Config, ConfigError, PageKind};
pub use stats::Stats;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use mapping_table::Pid;
use node::{free_chain, Node};
use stack::{Retired, Stack};
use tree::{Inner, TreeGuard};

/// Everything a thread can retire while pinned.
#[derive(Debug)]
pub(crate) enum Deferred<K, V> {
    /// A replaced or unlinked chain, freed down to its base record.
    Chain(NonNull<Node<K, V>>),
    /// The id of a retired page, recycled once no thread can still hold it.
    Pid { pid: Pid, free_pids: Arc<Stack<Pid>> },
    /// A cell popped from the free id stack.
    FreeListCell(Retired<Pid>),
}

unsafe impl<K: Send, V: Send> Send for Deferred<K, V> {}

impl<K, V> Drop for Deferred<K, V> {
    fn drop(&mut self) {
        match self {
            Deferred::Chain(head) => unsafe { free_chain(head.as_ptr()) },
            Deferred::Pid { pid, free_pids } => free_pids.push(*pid),
            Deferred::FreeListCell(_) => {}
        }
    }
}

/// Trait for types for which a minimum possible value exists.
///
/// This trait must be implemented for any `K` key type in the [`BwTree`].
pub trait Minimum: Ord {
    /// The returned value must be less than or equal
    /// to all possible values for this type.
    const MIN: Self;
}

/// Trait for types for which a maximum possible value exists.
///
/// This exists primarily to play nicely with [`std::cmp::Reverse`] keys,
/// whose minimum is the maximum of the wrapped type.
pub trait Maximum: Ord {
    /// The returned value must be greater than or equal
    /// to all possible values for this type.
    const MAX: Self;
}

impl Minimum for () {
    const MIN: Self = ();
}

impl<T: Maximum> Minimum for std::cmp::Reverse<T> {
    const MIN: Self = std::cmp::Reverse(T::MAX);
}

macro_rules! impl_integer {
    ($($t:ty),+) => {
        $(
            impl Minimum for $t {
                const MIN: Self = <$t>::MIN;
            }

            impl Maximum for $t {
                const MAX: Self = <$t>::MAX;
            }
        )*
    }
}

impl_integer!(usize, u8, u16, u32, u64, u128, isize, i8, i16, i32, i64, i128);

impl<T: Ord> Minimum for Vec<T> {
    const MIN: Self = Vec::new();
}

impl<T: Minimum, const LEN: usize> Minimum for [T; LEN] {
    const MIN: Self = [T::MIN; LEN];
}

impl Minimum for String {
    const MIN: Self = String::new();
}

impl Minimum for &str {
    const MIN: Self = "";
}

impl<T: Ord> Minimum for &[T] {
    const MIN: Self = &[];
}

/// A handle to a latch-free Bw-tree mapping each key to a set of values.
///
/// The same (key, value) pair is stored at most once, while a key may be
/// associated with any number of distinct values.
///
/// Note that this structure is `Send` but NOT `Sync`. Each handle buffers
/// the garbage its operations retire, so every thread works through its
/// own handle: clone the tree to get one. A clone is not registered with
/// the garbage collector, and must call [`BwTree::assign_gc_id`] with an id
/// that no other handle currently uses before its first operation.
///
/// `LOCAL_GC_BUFFER_SIZE` controls how many retired items a handle buffers
/// before sealing them into a bag tagged with the current epoch. Lower
/// values release memory sooner at the cost of more shared bookkeeping.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeSet;
///
/// let mut tree = bwtree::BwTree::<u64, u64>::default();
/// tree.update_thread_local(3);
/// tree.assign_gc_id(0);
///
/// assert!(tree.insert(1, 10));
/// assert!(tree.insert(1, 11));
/// // duplicate pairs are rejected
/// assert!(!tree.insert(1, 10));
/// assert_eq!(tree.get_value(&1), BTreeSet::from([10, 11]));
///
/// std::thread::scope(|s| {
///     for gc_id in 1..3 {
///         let mut handle = tree.clone();
///         s.spawn(move || {
///             handle.assign_gc_id(gc_id);
///             assert!(handle.insert(2, gc_id as u64));
///             handle.unregister_thread(gc_id);
///         });
///     }
/// });
///
/// assert_eq!(tree.get_value(&2), BTreeSet::from([1, 2]));
///
/// assert!(tree.delete(&1, &10));
/// assert!(!tree.delete(&1, &10));
/// assert_eq!(tree.get_value(&1), BTreeSet::from([11]));
///
/// tree.unregister_thread(0);
/// ```
pub struct BwTree<K, V, const LOCAL_GC_BUFFER_SIZE: usize = 64>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    // the tree structure and the shared collector
    inner: Arc<Inner<K, V>>,
    // the collector slot this handle pins, if registered
    gc_id: Option<usize>,
    // garbage retired by this handle that is not yet sealed into a bag
    garbage: RefCell<Vec<Deferred<K, V>>>,
}

impl<K, V, const LOCAL_GC_BUFFER_SIZE: usize> fmt::Debug for BwTree<K, V, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BwTree")
            .field("gc_id", &self.gc_id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K, V, const LOCAL_GC_BUFFER_SIZE: usize> Default for BwTree<K, V, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn default() -> BwTree<K, V, LOCAL_GC_BUFFER_SIZE> {
        BwTree::with_config(Config::default())
    }
}

impl<K, V, const LOCAL_GC_BUFFER_SIZE: usize> Clone for BwTree<K, V, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn clone(&self) -> BwTree<K, V, LOCAL_GC_BUFFER_SIZE> {
        BwTree {
            inner: self.inner.clone(),
            gc_id: None,
            garbage: RefCell::default(),
        }
    }
}

impl<K, V, const LOCAL_GC_BUFFER_SIZE: usize> Drop for BwTree<K, V, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn drop(&mut self) {
        self.flush();
        if let Some(gc_id) = self.gc_id.take() {
            self.inner.collector.unregister(gc_id);
        }
    }
}

impl<K, V, const LOCAL_GC_BUFFER_SIZE: usize> BwTree<K, V, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    /// Creates an empty tree with the default [`Config`].
    pub fn new() -> BwTree<K, V, LOCAL_GC_BUFFER_SIZE> {
        BwTree::default()
    }

    /// Creates an empty tree.
    ///
    /// # Panics
    ///
    /// Panics if `config` does not pass [`Config::validate`].
    pub fn with_config(config: Config) -> BwTree<K, V, LOCAL_GC_BUFFER_SIZE> {
        match BwTree::try_with_config(config) {
            Ok(tree) => tree,
            Err(e) => panic!("invalid BwTree configuration: {e}"),
        }
    }

    /// Creates an empty tree, or explains why `config` cannot work.
    pub fn try_with_config(
        config: Config,
    ) -> Result<BwTree<K, V, LOCAL_GC_BUFFER_SIZE>, ConfigError> {
        assert!(
            LOCAL_GC_BUFFER_SIZE > 0,
            "LOCAL_GC_BUFFER_SIZE must be greater than 0"
        );

        if let Err(e) = config.validate() {
            log::warn!("rejecting BwTree configuration {config:?}: {e}");
            return Err(e);
        }

        Ok(BwTree {
            inner: Arc::new(Inner::new(config)),
            gc_id: None,
            garbage: RefCell::new(Vec::with_capacity(LOCAL_GC_BUFFER_SIZE)),
        })
    }

    /// Registers this handle under garbage collection id `gc_id`. The id
    /// must be below the capacity set by [`BwTree::update_thread_local`]
    /// and not be in use by another handle.
    ///
    /// # Panics
    ///
    /// Panics if this handle is already registered, if `gc_id` is out of
    /// range, or if `gc_id` is already taken.
    pub fn assign_gc_id(&mut self, gc_id: usize) {
        if let Some(current) = self.gc_id {
            panic!("this handle is already registered as gc id {current}");
        }
        self.inner.collector.register(gc_id);
        self.gc_id = Some(gc_id);
    }

    /// Releases garbage collection id `gc_id`, which must be the id this
    /// handle registered with. Garbage buffered by the handle is handed
    /// to the shared collector.
    ///
    /// # Panics
    ///
    /// Panics if this handle is not registered as `gc_id`.
    pub fn unregister_thread(&mut self, gc_id: usize) {
        assert_eq!(
            self.gc_id,
            Some(gc_id),
            "unregister_thread called with a gc id this handle does not hold"
        );
        self.flush();
        self.inner.collector.unregister(gc_id);
        self.gc_id = None;
    }

    /// Sets the number of garbage collection slots, and therefore the
    /// number of ids that may be registered concurrently.
    ///
    /// # Panics
    ///
    /// Panics if a slot that would be removed is still registered.
    pub fn update_thread_local(&self, thread_num: usize) {
        self.inner.collector.resize(thread_num);
        log::debug!("resized garbage collection slots to {thread_num}");
    }

    /// Adds the pair `(key, value)`. Returns `false` if the exact pair was
    /// already present.
    ///
    /// # Panics
    ///
    /// Panics if this handle has not been registered with
    /// [`BwTree::assign_gc_id`].
    pub fn insert(&self, key: K, value: V) -> bool {
        let guard = self.pin();
        self.inner.insert(key, value, &guard)
    }

    /// Removes the pair `(key, value)`. Returns `false` if the pair was not
    /// present.
    ///
    /// # Panics
    ///
    /// Panics if this handle has not been registered with
    /// [`BwTree::assign_gc_id`].
    pub fn delete(&self, key: &K, value: &V) -> bool {
        let guard = self.pin();
        self.inner.delete(key, value, &guard)
    }

    /// Returns every value currently associated with `key`, which is empty
    /// if there are none.
    ///
    /// # Panics
    ///
    /// Panics if this handle has not been registered with
    /// [`BwTree::assign_gc_id`].
    pub fn get_value(&self, key: &K) -> BTreeSet<V> {
        let guard = self.pin();
        self.inner.get_value(key, &guard)
    }

    /// Returns `true` if the exact pair `(key, value)` is present.
    ///
    /// # Panics
    ///
    /// Panics if this handle has not been registered with
    /// [`BwTree::assign_gc_id`].
    pub fn contains(&self, key: &K, value: &V) -> bool {
        let guard = self.pin();
        self.inner.contains(key, value, &guard)
    }

    /// Seals the garbage buffered by this handle, advances the global epoch
    /// and releases everything no registered thread can still observe.
    /// Returns the number of retired items released.
    pub fn collect_garbage(&self) -> usize {
        self.flush();
        self.inner.collector.try_reclaim()
    }

    /// Counters describing the activity of this tree across all handles.
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// The configuration this tree was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The garbage collection id this handle is registered under.
    pub fn gc_id(&self) -> Option<usize> {
        self.gc_id
    }

    /// The number of garbage collection slots available for registration.
    pub fn gc_slots(&self) -> usize {
        self.inner.collector.capacity()
    }

    /// The number of handles currently registered with the collector.
    pub fn active_gc_slots(&self) -> usize {
        self.inner.collector.registered()
    }

    /// The number of retired items not yet released, including the ones
    /// buffered by this handle.
    pub fn pending_garbage(&self) -> usize {
        self.inner.collector.pending() + self.garbage.borrow().len()
    }

    fn pin(&self) -> TreeGuard<'_, K, V> {
        let gc_id = match self.gc_id {
            Some(gc_id) => gc_id,
            None => panic!("assign_gc_id must be called before operating on a BwTree handle"),
        };
        self.inner
            .collector
            .pin(gc_id, &self.garbage, LOCAL_GC_BUFFER_SIZE)
    }

    fn flush(&self) {
        let garbage = self.garbage.take();
        if !garbage.is_empty() {
            self.inner.collector.seal(garbage);
        }
    }
}

#[allow(unused)]
const fn _test_impls() {
    const fn send<T: Send>() {}
    const fn clone<T: Clone>() {}
    send::<BwTree<usize, usize>>();
    clone::<BwTree<usize, usize>>();
}
