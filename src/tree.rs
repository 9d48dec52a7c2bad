use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "timing")]
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::epoch::{Collector, Guard};
use crate::mapping_table::{MappingTable, Pid};
use crate::node::{free_chain, Delta, Node};
use crate::stats::{bump, Counters, Stats};
use crate::{Deferred, Minimum};

pub(crate) type TreeGuard<'a, K, V> = Guard<'a, Deferred<K, V>>;

/// A chain head loaded from the mapping table. It stays readable for as
/// long as the guard it was loaded under, even after being replaced.
pub(crate) struct NodeView<'g, K, V> {
    pub(crate) pid: Pid,
    pub(crate) ptr: NonNull<Node<K, V>>,
    _guard: PhantomData<&'g Node<K, V>>,
}

impl<'g, K, V> Clone for NodeView<'g, K, V> {
    fn clone(&self) -> NodeView<'g, K, V> {
        *self
    }
}

impl<'g, K, V> Copy for NodeView<'g, K, V> {}

impl<'g, K, V> Deref for NodeView<'g, K, V> {
    type Target = Node<K, V>;

    fn deref(&self) -> &Node<K, V> {
        unsafe { self.ptr.as_ref() }
    }
}

pub(crate) struct Cursor<'g, K, V> {
    pub(crate) leaf: NodeView<'g, K, V>,
    pub(crate) parent: Option<NodeView<'g, K, V>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intent {
    /// Only help structure modifications that are already underway.
    Read,
    /// Also consolidate, split and merge the inner pages on the way down.
    Write,
}

pub(crate) enum Maintenance<'g, K, V> {
    Unchanged,
    Replaced(NodeView<'g, K, V>),
    Restart,
}

/// State shared by every handle of a tree.
pub(crate) struct Inner<K, V>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    pub(crate) config: Config,
    pub(crate) root: AtomicU64,
    pub(crate) table: MappingTable<K, V>,
    pub(crate) collector: Collector<Deferred<K, V>>,
    pub(crate) counters: Counters,
    #[cfg(feature = "timing")]
    slowest_op: AtomicU64,
    #[cfg(feature = "timing")]
    fastest_op: AtomicU64,
}

impl<K, V> Drop for Inner<K, V>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    fn drop(&mut self) {
        #[cfg(feature = "timing")]
        self.print_timing();

        if cfg!(feature = "print_utilization_on_drop") {
            self.print_utilization();
        }

        let heads = self.table.drain();
        log::debug!("dropping tree with {} live pages", heads.len());
        for head in heads {
            unsafe { free_chain(head) };
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    pub(crate) fn new(config: Config) -> Inner<K, V> {
        let table = MappingTable::new();

        let leaf_pid = table.allocate_fresh(Node::leaf_base(K::MIN, None, None, vec![]));
        let root_pid = table.allocate_fresh(Node::inner_base(
            K::MIN,
            None,
            None,
            vec![(K::MIN, leaf_pid)],
            None,
        ));

        Inner {
            collector: Collector::new(config.initial_gc_slots, config.gc_threshold),
            config,
            root: AtomicU64::new(root_pid),
            table,
            counters: Counters::default(),
            #[cfg(feature = "timing")]
            slowest_op: u64::MIN.into(),
            #[cfg(feature = "timing")]
            fastest_op: u64::MAX.into(),
        }
    }

    pub(crate) fn stats(&self) -> Stats {
        self.counters
            .snapshot(self.collector.epochs_advanced(), self.collector.reclaimed())
    }

    pub(crate) fn root_pid(&self) -> Pid {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn view<'g>(
        &self,
        pid: Pid,
        _guard: &'g TreeGuard<'_, K, V>,
    ) -> Option<NodeView<'g, K, V>> {
        let ptr = NonNull::new(self.table.lookup(pid))?;
        Some(NodeView {
            pid,
            ptr,
            _guard: PhantomData,
        })
    }

    fn root<'g>(&self, guard: &'g TreeGuard<'_, K, V>) -> NodeView<'g, K, V> {
        loop {
            // root pages are never merged, so their slots are never cleared
            if let Some(view) = self.view(self.root_pid(), guard) {
                return view;
            }
        }
    }

    /// Replaces the head `view` was loaded from. On failure the
    /// replacement is dropped and the actual head, if any, is returned.
    pub(crate) fn install<'g>(
        &self,
        view: &NodeView<'g, K, V>,
        replacement: Box<Node<K, V>>,
    ) -> Result<NodeView<'g, K, V>, Option<NodeView<'g, K, V>>> {
        let replacement_ptr = Box::into_raw(replacement);

        match self
            .table
            .install(view.pid, view.ptr.as_ptr(), replacement_ptr)
        {
            Ok(()) => Ok(NodeView {
                pid: view.pid,
                ptr: unsafe { NonNull::new_unchecked(replacement_ptr) },
                _guard: PhantomData,
            }),
            Err(actual) => {
                drop(unsafe { Box::from_raw(replacement_ptr) });
                bump(&self.counters.cas_failures);

                Err(NonNull::new(actual).map(|ptr| NodeView {
                    pid: view.pid,
                    ptr,
                    _guard: PhantomData,
                }))
            }
        }
    }

    pub(crate) fn insert(&self, key: K, value: V, guard: &TreeGuard<'_, K, V>) -> bool {
        let mut attempt = 0;
        loop {
            let Cursor { leaf, parent } = self.leaf_for_key(&key, Intent::Write, guard);

            if leaf.contains(&key, &value) {
                return false;
            }

            let delta = leaf.prepend(
                leaf.ptr.as_ptr(),
                Delta::Insert {
                    key: key.clone(),
                    value: value.clone(),
                },
            );

            if let Ok(new_leaf) = self.install(&leaf, delta) {
                bump(&self.counters.inserts);
                self.maintain(new_leaf, parent.as_ref(), guard);
                return true;
            }

            self.config.backoff.snooze(attempt);
            attempt += 1;
        }
    }

    pub(crate) fn delete(&self, key: &K, value: &V, guard: &TreeGuard<'_, K, V>) -> bool {
        let mut attempt = 0;
        loop {
            let Cursor { leaf, parent } = self.leaf_for_key(key, Intent::Write, guard);

            if !leaf.contains(key, value) {
                return false;
            }

            let delta = leaf.prepend(
                leaf.ptr.as_ptr(),
                Delta::Delete {
                    key: key.clone(),
                    value: value.clone(),
                },
            );

            if let Ok(new_leaf) = self.install(&leaf, delta) {
                bump(&self.counters.deletes);
                self.maintain(new_leaf, parent.as_ref(), guard);
                return true;
            }

            self.config.backoff.snooze(attempt);
            attempt += 1;
        }
    }

    pub(crate) fn get_value(&self, key: &K, guard: &TreeGuard<'_, K, V>) -> BTreeSet<V> {
        bump(&self.counters.lookups);
        let Cursor { leaf, .. } = self.leaf_for_key(key, Intent::Read, guard);
        leaf.values_of(key)
    }

    pub(crate) fn contains(&self, key: &K, value: &V, guard: &TreeGuard<'_, K, V>) -> bool {
        bump(&self.counters.lookups);
        let Cursor { leaf, .. } = self.leaf_for_key(key, Intent::Read, guard);
        leaf.contains(key, value)
    }

    /// Finds the leaf whose range covers `key`, helping any structure
    /// modification encountered along the way.
    pub(crate) fn leaf_for_key<'g>(
        &self,
        key: &K,
        intent: Intent,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> Cursor<'g, K, V> {
        let mut parent_cursor_opt: Option<NodeView<'g, K, V>> = None;
        let mut cursor = self.root(guard);
        let mut root_pid = cursor.pid;

        macro_rules! reset {
            ($reason:expr) => {
                log::trace!("restarting traversal for page {}: {}", cursor.pid, $reason);
                parent_cursor_opt = None;
                cursor = self.root(guard);
                root_pid = cursor.pid;
                continue;
            };
        }

        #[cfg(feature = "timing")]
        let before = Instant::now();

        loop {
            if cursor.is_removed() {
                reset!("page is frozen by a merge");
            }

            if cursor.header.merging.is_some() {
                self.complete_merge(&cursor, guard);
                reset!("cooperatively completed a pending merge");
            }

            debug_assert!(cursor.header.lo <= *key);

            if let Some(hi) = &cursor.header.hi {
                if key >= hi {
                    // go right to the tree sibling
                    let right_pid = if let Some(right_pid) = cursor.header.right {
                        right_pid
                    } else {
                        reset!("bounded page without a right sibling");
                    };

                    let rhs = if let Some(view) = self.view(right_pid, guard) {
                        view
                    } else {
                        reset!("right sibling already retired");
                    };

                    match &parent_cursor_opt {
                        Some(parent_cursor) => {
                            self.ensure_index_term(parent_cursor.pid, right_pid, guard);
                        }
                        None if cursor.pid == root_pid => self.hoist_root(&cursor, guard),
                        None => {}
                    }

                    cursor = rhs;
                    continue;
                }
            }

            if intent == Intent::Write && !cursor.is_leaf() {
                match self.maintain(cursor, parent_cursor_opt.as_ref(), guard) {
                    Maintenance::Unchanged => {}
                    Maintenance::Replaced(view) => {
                        cursor = view;
                        continue;
                    }
                    Maintenance::Restart => {
                        reset!("structure modification changed the path");
                    }
                }
            }

            if cursor.is_leaf() {
                #[cfg(feature = "timing")]
                self.record_timing(before.elapsed());

                return Cursor {
                    leaf: cursor,
                    parent: parent_cursor_opt,
                };
            }

            let child_pid = if let Some(child_pid) = cursor.child_for(key) {
                child_pid
            } else {
                reset!("inner page has no route for the key");
            };

            let child = if let Some(view) = self.view(child_pid, guard) {
                view
            } else {
                reset!("child already retired");
            };

            parent_cursor_opt = Some(cursor);
            cursor = child;
        }
    }

    /// Consolidates, splits or merges the page behind `view` when it
    /// crossed one of the configured thresholds.
    pub(crate) fn maintain<'g>(
        &self,
        view: NodeView<'g, K, V>,
        parent: Option<&NodeView<'g, K, V>>,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> Maintenance<'g, K, V> {
        if view.is_removed() {
            return Maintenance::Unchanged;
        }

        let config = &self.config;
        let (min_size, max_size, chain_length) = if view.is_leaf() {
            (
                config.leaf_min_size,
                config.leaf_max_size,
                config.leaf_delta_chain_length,
            )
        } else {
            (
                config.inner_min_size,
                config.inner_max_size,
                config.inner_delta_chain_length,
            )
        };

        let mut current = view;
        let mut replaced = false;

        if current.header.depth > chain_length {
            match self.consolidate(&current, guard) {
                Some(consolidated) => {
                    current = consolidated;
                    replaced = true;
                }
                None => return Maintenance::Unchanged,
            }
        }

        let header = &current.header;
        let is_root = current.pid == self.root_pid();

        if header.depth == 0 && header.size > max_size && header.merging.is_none() {
            if let Some(split) = self.split(&current, parent, guard) {
                return Maintenance::Replaced(split);
            }
        }

        if header.size < min_size && header.merging.is_none() && !is_root {
            if let Some(parent) = parent {
                if self.try_merge(parent, &current, guard) {
                    return Maintenance::Restart;
                }
            }
        }

        if replaced {
            Maintenance::Replaced(current)
        } else {
            Maintenance::Unchanged
        }
    }

    /// Replaces a chain with a single base record holding the same
    /// logical contents.
    pub(crate) fn consolidate<'g>(
        &self,
        view: &NodeView<'g, K, V>,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> Option<NodeView<'g, K, V>> {
        let base = view.consolidate();
        let consolidated = self.install(view, base).ok()?;

        guard.defer(Deferred::Chain(view.ptr));
        bump(&self.counters.consolidations);

        log::debug!(
            "consolidated page {} from {} deltas into {} entries",
            view.pid,
            view.header.depth,
            consolidated.header.size
        );

        Some(consolidated)
    }

    #[cfg(feature = "timing")]
    fn print_timing(&self) {
        println!(
            "min : {:?}",
            Duration::from_nanos(self.fastest_op.load(Ordering::Acquire))
        );
        println!(
            "max : {:?}",
            Duration::from_nanos(self.slowest_op.load(Ordering::Acquire))
        );
    }

    #[cfg(feature = "timing")]
    fn record_timing(&self, time: Duration) {
        let nanos = time.as_nanos() as u64;
        let min = self.fastest_op.load(Ordering::Relaxed);
        if nanos < min {
            self.fastest_op.fetch_min(nanos, Ordering::Relaxed);
        }

        let max = self.slowest_op.load(Ordering::Relaxed);
        if nanos > max {
            self.slowest_op.fetch_max(nanos, Ordering::Relaxed);
        }
    }

    /// Walks every level from left to right and prints how full its pages
    /// are. Must only run once no other thread can touch the tree.
    fn print_utilization(&self) {
        let mut level_head = Some(self.root_pid());
        let mut layer = 0;

        while let Some(first) = level_head.take() {
            layer += 1;

            let mut min_fill: f64 = f64::MAX;
            let mut max_fill: f64 = 0.0;
            let mut fill_sum: f64 = 0.0;
            let mut pages_counted: usize = 0;
            let mut deltas: usize = 0;

            let mut next = Some(first);
            while let Some(pid) = next {
                let node = if let Some(node) = unsafe { self.table.lookup(pid).as_ref() } {
                    node
                } else {
                    break;
                };

                if pid == first && !node.is_leaf() {
                    level_head = node.child_for(&node.header.lo);
                }

                let capacity = if node.is_leaf() {
                    self.config.leaf_max_size
                } else {
                    self.config.inner_max_size
                };

                let fill = node.header.size as f64 / capacity as f64;
                min_fill = min_fill.min(fill);
                max_fill = max_fill.max(fill);
                fill_sum += fill;
                deltas += node.header.depth;
                pages_counted += 1;

                next = node.header.right;
            }

            println!(
                "layer {layer}: {pages_counted} pages, {deltas} unconsolidated deltas, \
                 min fill {min_fill:.2}, max fill {max_fill:.2}, avg fill {:.2}",
                fill_sum / pages_counted.max(1) as f64
            );
        }
    }
}
