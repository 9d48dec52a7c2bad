use std::collections::{BTreeMap, BTreeSet};
use std::ptr;

use crate::mapping_table::Pid;

/// Metadata every record of a chain carries, so that a thread holding
/// only the chain head knows the page's logical state without walking
/// the chain.
#[derive(Debug, Clone)]
pub(crate) struct Header<K> {
    /// Inclusive lower bound, fixed for the lifetime of the page.
    pub(crate) lo: K,
    /// Exclusive upper bound, `None` for the rightmost page of a level.
    pub(crate) hi: Option<K>,
    /// Right sibling, always `Some` when `hi` is.
    pub(crate) right: Option<Pid>,
    /// Number of delta records above the base record.
    pub(crate) depth: usize,
    /// Logical entry count: pairs for leaves, routing entries for inner
    /// pages.
    pub(crate) size: usize,
    pub(crate) is_leaf: bool,
    /// Separator and child of an announced merge, for inner pages only.
    pub(crate) merging: Option<(K, Pid)>,
}

impl<K: Ord> Header<K> {
    pub(crate) fn covers(&self, key: &K) -> bool {
        self.lo <= *key && self.hi.as_ref().map_or(true, |hi| key < hi)
    }

    /// Whether a page with these bounds may hold a routing entry for a
    /// page bounded by `child`.
    pub(crate) fn is_viable_parent_for(&self, child: &Header<K>) -> bool {
        match (&self.hi, &child.hi) {
            (Some(_), None) => return false,
            (Some(hi), Some(child_hi)) if hi < child_hi => return false,
            _ => {}
        }
        self.lo <= child.lo
    }
}

#[derive(Debug)]
pub(crate) enum Delta<K, V> {
    /// Sorted, unique (key, value) pairs.
    LeafBase(Vec<(K, V)>),
    /// Routing entries sorted by separator. The first separator equals the
    /// page's lower bound.
    InnerBase(Vec<(K, Pid)>),
    Insert {
        key: K,
        value: V,
    },
    Delete {
        key: K,
        value: V,
    },
    /// Keys at or above `separator` moved to `sibling`.
    Split {
        separator: K,
        sibling: Pid,
    },
    /// Routes `[separator, high)` to `child`.
    IndexTerm {
        separator: K,
        child: Pid,
        high: Option<K>,
    },
    /// Freezes the page until its left sibling absorbs it.
    RemoveNode,
    /// Announces that `child`, routed from `separator`, is being merged
    /// into its left sibling.
    MergeIntent {
        separator: K,
        child: Pid,
    },
    /// Drops the routing entry of a merged child and ends the merge.
    IndexTermRetract {
        separator: K,
        child: Pid,
    },
}

/// One immutable record of a delta chain. `next` is not owned: it points
/// at the previous head, which stays alive for as long as this record is
/// reachable.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) header: Header<K>,
    pub(crate) delta: Delta<K, V>,
    pub(crate) next: *mut Node<K, V>,
}

unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Node<K, V> {}

/// The logical contents of a page after folding its chain.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Content<K, V> {
    Leaf(Vec<(K, V)>),
    Inner(Vec<(K, Pid)>),
}

impl<K, V> Content<K, V> {
    fn len(&self) -> usize {
        match self {
            Content::Leaf(entries) => entries.len(),
            Content::Inner(entries) => entries.len(),
        }
    }
}

pub(crate) struct Chain<'a, K, V> {
    cursor: Option<&'a Node<K, V>>,
}

impl<'a, K, V> Iterator for Chain<'a, K, V> {
    type Item = &'a Node<K, V>;

    fn next(&mut self) -> Option<&'a Node<K, V>> {
        let node = self.cursor?;
        // records below a reachable head are retired together with it
        self.cursor = unsafe { node.next.as_ref() };
        Some(node)
    }
}

/// Frees `head` and every record below it.
///
/// # Safety
///
/// The chain must be unreachable by every other thread, and no other
/// owner may free any of its records.
pub(crate) unsafe fn free_chain<K, V>(head: *mut Node<K, V>) {
    let mut cursor = head;
    while !cursor.is_null() {
        let node = Box::from_raw(cursor);
        cursor = node.next;
    }
}

impl<K, V> Node<K, V>
where
    K: Clone + Ord,
    V: Clone + Ord,
{
    pub(crate) fn leaf_base(
        lo: K,
        hi: Option<K>,
        right: Option<Pid>,
        entries: Vec<(K, V)>,
    ) -> Box<Node<K, V>> {
        Box::new(Node {
            header: Header {
                lo,
                hi,
                right,
                depth: 0,
                size: entries.len(),
                is_leaf: true,
                merging: None,
            },
            delta: Delta::LeafBase(entries),
            next: ptr::null_mut(),
        })
    }

    pub(crate) fn inner_base(
        lo: K,
        hi: Option<K>,
        right: Option<Pid>,
        entries: Vec<(K, Pid)>,
        merging: Option<(K, Pid)>,
    ) -> Box<Node<K, V>> {
        debug_assert!(entries.first().map_or(false, |(sep, _)| *sep == lo));
        Box::new(Node {
            header: Header {
                lo,
                hi,
                right,
                depth: 0,
                size: entries.len(),
                is_leaf: false,
                merging,
            },
            delta: Delta::InnerBase(entries),
            next: ptr::null_mut(),
        })
    }

    fn from_content(mut header: Header<K>, content: Content<K, V>) -> Box<Node<K, V>> {
        header.depth = 0;
        header.size = content.len();
        let delta = match content {
            Content::Leaf(entries) => Delta::LeafBase(entries),
            Content::Inner(entries) => Delta::InnerBase(entries),
        };
        Box::new(Node {
            header,
            delta,
            next: ptr::null_mut(),
        })
    }

    /// Builds a record that logically applies `delta` on top of `self`,
    /// which must currently be the head stored at `head_ptr`.
    pub(crate) fn prepend(&self, head_ptr: *mut Node<K, V>, delta: Delta<K, V>) -> Box<Node<K, V>> {
        let mut header = self.header.clone();
        header.depth += 1;

        match &delta {
            Delta::Insert { .. } | Delta::IndexTerm { .. } => header.size += 1,
            Delta::Delete { .. } => header.size = header.size.saturating_sub(1),
            Delta::IndexTermRetract { .. } => {
                header.size = header.size.saturating_sub(1);
                header.merging = None;
            }
            Delta::Split { separator, sibling } => {
                header.hi = Some(separator.clone());
                header.right = Some(*sibling);
            }
            Delta::MergeIntent { separator, child } => {
                header.merging = Some((separator.clone(), *child));
            }
            Delta::RemoveNode => {}
            Delta::LeafBase(_) | Delta::InnerBase(_) => {
                panic!("base records are never prepended to a chain")
            }
        }

        Box::new(Node {
            header,
            delta,
            next: head_ptr,
        })
    }

    pub(crate) fn chain(&self) -> Chain<'_, K, V> {
        Chain { cursor: Some(self) }
    }

    pub(crate) fn is_removed(&self) -> bool {
        matches!(self.delta, Delta::RemoveNode)
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.header.is_leaf
    }

    /// Every value currently associated with `key` in this leaf.
    pub(crate) fn values_of(&self, key: &K) -> BTreeSet<V> {
        let mut decided: BTreeSet<&V> = BTreeSet::new();
        let mut ret = BTreeSet::new();

        for node in self.chain() {
            match &node.delta {
                Delta::Insert { key: k, value } if k == key => {
                    if decided.insert(value) {
                        ret.insert(value.clone());
                    }
                }
                Delta::Delete { key: k, value } if k == key => {
                    decided.insert(value);
                }
                Delta::LeafBase(entries) => {
                    let start = entries.partition_point(|(k, _)| k < key);
                    for (_, value) in entries[start..].iter().take_while(|(k, _)| k == key) {
                        if !decided.contains(value) {
                            ret.insert(value.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        ret
    }

    /// Whether the exact pair is present in this leaf. The newest record
    /// mentioning the pair decides.
    pub(crate) fn contains(&self, key: &K, value: &V) -> bool {
        for node in self.chain() {
            match &node.delta {
                Delta::Insert { key: k, value: v } if k == key && v == value => return true,
                Delta::Delete { key: k, value: v } if k == key && v == value => return false,
                Delta::LeafBase(entries) => {
                    return entries
                        .binary_search_by(|(k, v)| k.cmp(key).then_with(|| v.cmp(value)))
                        .is_ok();
                }
                _ => {}
            }
        }
        false
    }

    /// The child of this inner page responsible for `key`: the entry with
    /// the greatest separator at or below `key`.
    pub(crate) fn child_for(&self, key: &K) -> Option<Pid> {
        self.greatest_entry(|separator| separator <= key)
    }

    /// The child whose separator directly precedes `separator`.
    pub(crate) fn child_before(&self, separator: &K) -> Option<Pid> {
        self.greatest_entry(|s| s < separator)
    }

    fn greatest_entry<F>(&self, admits: F) -> Option<Pid>
    where
        F: Fn(&K) -> bool,
    {
        // separators already decided by a newer record
        let mut shadowed: Vec<&K> = vec![];
        let mut best: Option<(&K, Pid)> = None;

        for node in self.chain() {
            match &node.delta {
                Delta::IndexTerm {
                    separator, child, ..
                } => {
                    if shadowed.contains(&separator) {
                        continue;
                    }
                    shadowed.push(separator);
                    if admits(separator) && best.map_or(true, |(b, _)| separator > b) {
                        best = Some((separator, *child));
                    }
                }
                Delta::IndexTermRetract { separator, .. } => {
                    if !shadowed.contains(&separator) {
                        shadowed.push(separator);
                    }
                }
                Delta::InnerBase(entries) => {
                    let end = entries.partition_point(|(k, _)| admits(k));
                    let candidate = entries[..end]
                        .iter()
                        .rev()
                        .find(|(k, _)| !shadowed.contains(&k));
                    if let Some((k, child)) = candidate {
                        if best.map_or(true, |(b, _)| k > b) {
                            best = Some((k, *child));
                        }
                    }
                }
                _ => {}
            }
        }

        best.map(|(_, child)| child)
    }

    /// The child currently routed from exactly `separator`, if any.
    pub(crate) fn entry_for(&self, separator: &K) -> Option<Pid> {
        for node in self.chain() {
            match &node.delta {
                Delta::IndexTerm { separator: s, child, .. } if s == separator => {
                    return Some(*child)
                }
                Delta::IndexTermRetract { separator: s, .. } if s == separator => return None,
                Delta::InnerBase(entries) => {
                    return entries
                        .binary_search_by(|(k, _)| k.cmp(separator))
                        .ok()
                        .map(|index| entries[index].1);
                }
                _ => {}
            }
        }
        None
    }

    /// Folds the chain into sorted entries restricted to the page's
    /// current bounds.
    pub(crate) fn content(&self) -> Content<K, V> {
        let header = &self.header;
        let records: Vec<&Node<K, V>> = self.chain().collect();

        let (base, deltas) = match records.split_last() {
            Some(split) => split,
            None => unreachable!("a chain always contains its head"),
        };

        match &base.delta {
            Delta::LeafBase(entries) => {
                let mut pairs: BTreeSet<(K, V)> = entries.iter().cloned().collect();
                for node in deltas.iter().rev() {
                    match &node.delta {
                        Delta::Insert { key, value } => {
                            pairs.insert((key.clone(), value.clone()));
                        }
                        Delta::Delete { key, value } => {
                            pairs.remove(&(key.clone(), value.clone()));
                        }
                        _ => {}
                    }
                }
                Content::Leaf(pairs.into_iter().filter(|(k, _)| header.covers(k)).collect())
            }
            Delta::InnerBase(entries) => {
                let mut routes: BTreeMap<K, Pid> = entries.iter().cloned().collect();
                for node in deltas.iter().rev() {
                    match &node.delta {
                        Delta::IndexTerm {
                            separator, child, ..
                        } => {
                            routes.insert(separator.clone(), *child);
                        }
                        Delta::IndexTermRetract { separator, .. } => {
                            routes.remove(separator);
                        }
                        _ => {}
                    }
                }
                Content::Inner(routes.into_iter().filter(|(k, _)| header.covers(k)).collect())
            }
            _ => unreachable!("chains always end in a base record"),
        }
    }

    /// A single base record with the same logical contents and bounds.
    pub(crate) fn consolidate(&self) -> Box<Node<K, V>> {
        Node::from_content(self.header.clone(), self.content())
    }

    /// The base record of the left page after it absorbs the frozen
    /// `right` page, which must be its direct right sibling.
    pub(crate) fn absorb(&self, right: &Node<K, V>) -> Box<Node<K, V>> {
        debug_assert!(right.is_removed());
        debug_assert!(self.header.hi.as_ref() == Some(&right.header.lo));

        let content = match (self.content(), right.content()) {
            (Content::Leaf(mut left), Content::Leaf(right)) => {
                left.extend(right);
                Content::Leaf(left)
            }
            (Content::Inner(mut left), Content::Inner(right)) => {
                left.extend(right);
                Content::Inner(left)
            }
            _ => unreachable!("siblings always live on the same level"),
        };

        let header = Header {
            hi: right.header.hi.clone(),
            right: right.header.right,
            ..self.header.clone()
        };

        Node::from_content(header, content)
    }

    /// Splits a base record near its middle. Returns the separator, the
    /// number of entries staying on the left, and the base record of the
    /// new right sibling. Leaves never separate equal keys, so a leaf
    /// holding a single distinct key cannot be split.
    pub(crate) fn split_base(&self) -> Option<(K, usize, Box<Node<K, V>>)> {
        let header = &self.header;
        match &self.delta {
            Delta::LeafBase(entries) => {
                let index = leaf_split_index(entries)?;
                let separator = entries[index].0.clone();
                let rhs = Node::leaf_base(
                    separator.clone(),
                    header.hi.clone(),
                    header.right,
                    entries[index..].to_vec(),
                );
                Some((separator, index, rhs))
            }
            Delta::InnerBase(entries) => {
                if entries.len() < 2 {
                    return None;
                }
                let index = entries.len() / 2;
                let separator = entries[index].0.clone();
                let rhs = Node::inner_base(
                    separator.clone(),
                    header.hi.clone(),
                    header.right,
                    entries[index..].to_vec(),
                    None,
                );
                Some((separator, index, rhs))
            }
            _ => None,
        }
    }
}

/// The split point closest to the middle that does not separate two
/// pairs sharing a key.
fn leaf_split_index<K: Ord, V>(entries: &[(K, V)]) -> Option<usize> {
    let is_boundary = |index: usize| entries[index - 1].0 != entries[index].0;
    let middle = entries.len() / 2;

    if middle == 0 {
        return None;
    }

    (middle..entries.len())
        .find(|index| is_boundary(*index))
        .or_else(|| (1..middle).rev().find(|index| is_boundary(*index)))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::{free_chain, leaf_split_index, Content, Delta, Node};

    fn push(chain: &mut *mut Node<u32, u32>, delta: Delta<u32, u32>) {
        let head = unsafe { &**chain };
        *chain = Box::into_raw(head.prepend(*chain, delta));
    }

    #[test]
    fn leaf_fold_prefers_newest_record() {
        let mut head = Box::into_raw(Node::leaf_base(
            0,
            None,
            None,
            vec![(1, 10), (1, 11), (2, 20)],
        ));

        push(&mut head, Delta::Delete { key: 1, value: 10 });
        push(&mut head, Delta::Insert { key: 1, value: 12 });
        push(&mut head, Delta::Insert { key: 1, value: 10 });
        push(&mut head, Delta::Delete { key: 2, value: 20 });

        let node = unsafe { &*head };
        assert_eq!(node.header.depth, 4);
        assert_eq!(node.header.size, 3);
        assert_eq!(node.values_of(&1), BTreeSet::from([10, 11, 12]));
        assert_eq!(node.values_of(&2), BTreeSet::new());
        assert!(node.contains(&1, &10));
        assert!(!node.contains(&2, &20));
        assert!(!node.contains(&3, &30));

        let base = node.consolidate();
        assert_eq!(base.header.depth, 0);
        assert_eq!(base.header.size, 3);
        assert_eq!(
            base.content(),
            Content::Leaf(vec![(1, 10), (1, 11), (1, 12)])
        );

        unsafe { free_chain(head) };
    }

    #[test]
    fn split_delta_hides_moved_keys() {
        let base = Node::leaf_base(0, None, None, (0..8).map(|k| (k, k)).collect());
        let (separator, low, rhs) = base.split_base().unwrap();
        assert_eq!(separator, 4);
        assert_eq!(low, 4);
        assert_eq!(rhs.header.lo, 4);
        assert_eq!(rhs.header.size, 4);

        let mut head = Box::into_raw(base);
        push(&mut head, Delta::Split { separator, sibling: 7 });

        let node = unsafe { &*head };
        assert_eq!(node.header.hi, Some(4));
        assert_eq!(node.header.right, Some(7));
        assert!(!node.header.covers(&4));
        assert_eq!(
            node.content(),
            Content::Leaf((0..4).map(|k| (k, k)).collect())
        );

        unsafe { free_chain(head) };
    }

    #[test]
    fn inner_routing_respects_index_terms_and_retractions() {
        let mut head: *mut Node<u32, u32> =
            Box::into_raw(Node::inner_base(0, None, None, vec![(0, 1), (10, 2), (20, 3)], None));

        push(
            &mut head,
            Delta::IndexTerm {
                separator: 15,
                child: 4,
                high: Some(20),
            },
        );
        push(&mut head, Delta::MergeIntent { separator: 10, child: 2 });
        assert_eq!(unsafe { &*head }.header.merging, Some((10, 2)));
        push(&mut head, Delta::IndexTermRetract { separator: 10, child: 2 });

        let node = unsafe { &*head };
        assert_eq!(node.header.merging, None);
        assert_eq!(node.header.size, 3);
        assert_eq!(node.child_for(&5), Some(1));
        assert_eq!(node.child_for(&12), Some(1));
        assert_eq!(node.child_for(&15), Some(4));
        assert_eq!(node.child_for(&19), Some(4));
        assert_eq!(node.child_for(&25), Some(3));
        assert_eq!(node.child_before(&15), Some(1));
        assert_eq!(node.entry_for(&10), None);
        assert_eq!(node.entry_for(&15), Some(4));
        assert_eq!(node.entry_for(&20), Some(3));

        assert_eq!(
            node.content(),
            Content::Inner(vec![(0, 1), (15, 4), (20, 3)])
        );

        unsafe { free_chain(head) };
    }

    #[test]
    fn absorb_concatenates_siblings() {
        let left = Node::leaf_base(0, Some(10), Some(2), vec![(1, 1), (5, 5)]);
        let right_base = Box::into_raw(Node::leaf_base(10, Some(20), Some(3), vec![(12, 12)]));
        let frozen = Box::into_raw(unsafe { &*right_base }.prepend(right_base, Delta::RemoveNode));

        let merged = left.absorb(unsafe { &*frozen });
        assert_eq!(merged.header.lo, 0);
        assert_eq!(merged.header.hi, Some(20));
        assert_eq!(merged.header.right, Some(3));
        assert_eq!(
            merged.content(),
            Content::Leaf(vec![(1, 1), (5, 5), (12, 12)])
        );

        unsafe { free_chain(frozen) };
        assert!(merged.next.is_null());
    }

    #[test]
    fn leaf_splits_never_separate_duplicate_keys() {
        assert_eq!(leaf_split_index::<u32, u32>(&[]), None);
        assert_eq!(leaf_split_index(&[(1, 1)]), None);
        assert_eq!(leaf_split_index(&[(1, 1), (1, 2), (1, 3), (1, 4)]), None);
        assert_eq!(leaf_split_index(&[(1, 1), (1, 2), (1, 3), (2, 4)]), Some(3));
        assert_eq!(leaf_split_index(&[(1, 1), (2, 2), (2, 3), (2, 4)]), Some(1));
        assert_eq!(leaf_split_index(&[(1, 1), (2, 2), (3, 3), (4, 4)]), Some(2));
    }
}
