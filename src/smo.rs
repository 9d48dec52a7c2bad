//! Structure modifications: splits, index term posting, root hoisting and
//! merges.
//!
//! Every modification is a sequence of individually published steps. Any
//! thread that observes an intermediate state can finish the remaining
//! steps, so a stalled thread never blocks the others.

use std::sync::atomic::Ordering;

use crate::debug_delay;
use crate::mapping_table::Pid;
use crate::node::{Delta, Node};
use crate::stats::bump;
use crate::tree::{Inner, NodeView, TreeGuard};
use crate::{Deferred, Minimum};

impl<K, V> Inner<K, V>
where
    K: 'static + Clone + Minimum + Ord + Send + Sync,
    V: 'static + Clone + Ord + Send + Sync,
{
    /// Moves the upper half of a base page into a new right sibling and
    /// publishes the split with a single delta on the original page.
    pub(crate) fn split<'g>(
        &self,
        view: &NodeView<'g, K, V>,
        parent: Option<&NodeView<'g, K, V>>,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> Option<NodeView<'g, K, V>> {
        let (separator, low_size, rhs) = view.split_base()?;
        let moved = rhs.header.size;
        let sibling = self.table.allocate(rhs, guard);

        let mut delta = view.prepend(
            view.ptr.as_ptr(),
            Delta::Split {
                separator,
                sibling,
            },
        );
        delta.header.size = low_size;

        let split = match self.install(view, delta) {
            Ok(split) => split,
            Err(_) => {
                // the sibling was never linked, so it can be reused right away
                self.table.release_unpublished(sibling);
                return None;
            }
        };

        bump(&self.counters.splits);
        log::trace!(
            "split page {} into {} + {} entries, new sibling {}",
            view.pid,
            low_size,
            moved,
            sibling
        );

        match parent {
            Some(parent) => self.ensure_index_term(parent.pid, sibling, guard),
            None if view.pid == self.root_pid() => self.hoist_root(&split, guard),
            None => {}
        }

        Some(split)
    }

    /// Makes sure `parent` routes to `sibling`, a page that became
    /// reachable through its left neighbor's right link. Does nothing if
    /// the entry already exists, if `parent` does not cover the sibling's
    /// range, or if the sibling is being merged away.
    pub(crate) fn ensure_index_term(
        &self,
        parent_pid: Pid,
        sibling_pid: Pid,
        guard: &TreeGuard<'_, K, V>,
    ) {
        let mut attempt = 0;
        loop {
            let parent = if let Some(parent) = self.view(parent_pid, guard) {
                parent
            } else {
                return;
            };

            if parent.is_removed() || parent.is_leaf() {
                return;
            }

            // loaded after the parent: a sibling that was merged away and
            // retracted from this parent version is seen frozen or cleared
            let sibling = if let Some(sibling) = self.view(sibling_pid, guard) {
                sibling
            } else {
                return;
            };

            if sibling.is_removed()
                || !parent.header.is_viable_parent_for(&sibling.header)
                || parent.entry_for(&sibling.header.lo).is_some()
            {
                return;
            }

            let delta = parent.prepend(
                parent.ptr.as_ptr(),
                Delta::IndexTerm {
                    separator: sibling.header.lo.clone(),
                    child: sibling_pid,
                    high: sibling.header.hi.clone(),
                },
            );

            if self.install(&parent, delta).is_ok() {
                bump(&self.counters.index_terms);
                log::trace!(
                    "posted index term for page {} into parent {}",
                    sibling_pid,
                    parent_pid
                );
                return;
            }

            self.config.backoff.snooze(attempt);
            attempt += 1;
        }
    }

    /// Installs a new root above a root page that has split.
    pub(crate) fn hoist_root<'g>(
        &self,
        old_root: &NodeView<'g, K, V>,
        guard: &'g TreeGuard<'_, K, V>,
    ) {
        let (hi, right) = match (&old_root.header.hi, old_root.header.right) {
            (Some(hi), Some(right)) => (hi.clone(), right),
            _ => return,
        };

        let lo = old_root.header.lo.clone();
        let new_root = Node::inner_base(
            lo.clone(),
            None,
            None,
            vec![(lo, old_root.pid), (hi, right)],
            None,
        );
        let new_root_pid = self.table.allocate(new_root, guard);

        let worked = !debug_delay()
            && self
                .root
                .compare_exchange(
                    old_root.pid,
                    new_root_pid,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();

        if worked {
            bump(&self.counters.root_hoists);
            log::trace!(
                "hoisted root from page {} to page {}",
                old_root.pid,
                new_root_pid
            );
        } else {
            self.table.release_unpublished(new_root_pid);
        }
    }

    /// Announces in `parent` that `child` will be merged into its left
    /// sibling, then drives the merge to completion. Returns `false` if
    /// the announcement could not be made.
    pub(crate) fn try_merge<'g>(
        &self,
        parent: &NodeView<'g, K, V>,
        child: &NodeView<'g, K, V>,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> bool {
        let is_leftmost_child = child.header.lo == parent.header.lo;

        if is_leftmost_child
            || parent.is_removed()
            || parent.header.merging.is_some()
            || child.header.merging.is_some()
            || parent.entry_for(&child.header.lo) != Some(child.pid)
        {
            return false;
        }

        let delta = parent.prepend(
            parent.ptr.as_ptr(),
            Delta::MergeIntent {
                separator: child.header.lo.clone(),
                child: child.pid,
            },
        );

        let new_parent = if let Ok(new_parent) = self.install(parent, delta) {
            new_parent
        } else {
            return false;
        };

        log::trace!(
            "page {} announced merge of child {}",
            parent.pid,
            child.pid
        );

        self.complete_merge(&new_parent, guard);
        true
    }

    /// Finishes the merge announced in `parent`:
    ///
    /// 1. freeze the child with a remove delta
    /// 2. let the page whose right link points at the child absorb it
    /// 3. retract the child's routing entry, ending the merge
    /// 4. clear the child's slot and retire its chain and page id
    ///
    /// Each step is skipped if another thread already performed it.
    pub(crate) fn complete_merge<'g>(
        &self,
        parent: &NodeView<'g, K, V>,
        guard: &'g TreeGuard<'_, K, V>,
    ) {
        let (separator, child_pid) = if let Some(merging) = &parent.header.merging {
            merging.clone()
        } else {
            return;
        };
        let parent_pid = parent.pid;

        let frozen = if let Some(frozen) = self.freeze(child_pid, guard) {
            frozen
        } else {
            // the slot is only cleared after the retraction
            return;
        };

        let left_pid = if let Some(left_pid) = parent.child_before(&separator) {
            left_pid
        } else {
            return;
        };

        if !self.absorb(left_pid, &frozen, guard) {
            return;
        }

        let mut attempt = 0;
        loop {
            let parent = if let Some(parent) = self.view(parent_pid, guard) {
                parent
            } else {
                return;
            };

            let still_merging = match &parent.header.merging {
                Some((s, c)) => *c == child_pid && *s == separator,
                None => false,
            };
            if !still_merging {
                break;
            }

            let delta = parent.prepend(
                parent.ptr.as_ptr(),
                Delta::IndexTermRetract {
                    separator: separator.clone(),
                    child: child_pid,
                },
            );

            if self.install(&parent, delta).is_ok() {
                break;
            }

            self.config.backoff.snooze(attempt);
            attempt += 1;
        }

        if self.table.clear(child_pid, frozen.ptr.as_ptr()) {
            guard.defer(Deferred::Chain(frozen.ptr));
            guard.defer(self.table.deferred_release(child_pid));
            bump(&self.counters.merges);

            log::trace!(
                "retired page {} after merging it into its left sibling",
                child_pid
            );
        }
    }

    /// Prepends a remove delta to `child_pid`, first finishing any merge
    /// the child itself announced. Returns the frozen head, or `None` once
    /// the page is gone.
    fn freeze<'g>(
        &self,
        child_pid: Pid,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> Option<NodeView<'g, K, V>> {
        let mut attempt = 0;
        loop {
            let child = self.view(child_pid, guard)?;

            if child.is_removed() {
                return Some(child);
            }

            if child.header.merging.is_some() {
                self.complete_merge(&child, guard);
                continue;
            }

            let delta = child.prepend(child.ptr.as_ptr(), Delta::RemoveNode);
            if let Ok(frozen) = self.install(&child, delta) {
                return Some(frozen);
            }

            self.config.backoff.snooze(attempt);
            attempt += 1;
        }
    }

    /// Walks right from `left_pid` to the page whose right link is the
    /// frozen page and replaces it with a base record holding both. Returns
    /// `false` if the walk hit a state that requires starting over.
    fn absorb<'g>(
        &self,
        left_pid: Pid,
        frozen: &NodeView<'g, K, V>,
        guard: &'g TreeGuard<'_, K, V>,
    ) -> bool {
        let mut cursor_pid = left_pid;
        let mut attempt = 0;

        loop {
            let left = if let Some(left) = self.view(cursor_pid, guard) {
                left
            } else {
                return false;
            };

            if left.is_removed() {
                return false;
            }

            if left.header.right == Some(frozen.pid) {
                let merged = left.absorb(frozen);
                if self.install(&left, merged).is_ok() {
                    guard.defer(Deferred::Chain(left.ptr));
                    log::debug!(
                        "page {} absorbed frozen page {}",
                        left.pid,
                        frozen.pid
                    );
                    return true;
                }

                self.config.backoff.snooze(attempt);
                attempt += 1;
                continue;
            }

            let already_absorbed = match (&left.header.hi, &frozen.header.hi) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(hi), Some(frozen_hi)) => hi >= frozen_hi,
            };
            if already_absorbed {
                return true;
            }

            cursor_pid = if let Some(right) = left.header.right {
                right
            } else {
                return false;
            };
        }
    }
}
