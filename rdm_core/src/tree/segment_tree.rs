//! The segment tree: an arena of `SegmentNode`s whose leaves partition the
//! currently assigned-or-pending work for one download (spec §3, §4.1).
//!
//! Modeled as a forest rather than a strict single-rooted tree: the normal
//! fresh-download case produces one root that repeatedly splits, but the
//! recovery path (multiple on-disk gaps) seeds one independent root per
//! gap. `split`/`splitSegmentNode` operate uniformly over the leaf set
//! regardless of which root a leaf descends from.

use crate::error::EngineError;
use crate::segment::Segment;
use crate::types::MINIMUM_DOWNLOAD_SEGMENT_LENGTH;

use super::node::{NodeId, SegmentNode, SegmentStatus};

pub struct SegmentTree {
    nodes: Vec<SegmentNode>,
    roots: Vec<NodeId>,
    /// Leaves in left-to-right (ascending start-byte) order. Maintained
    /// incrementally on every split/collapse rather than recomputed, per
    /// spec §9's "iterates an index set rebuilt on mutation."
    leaf_order: Vec<NodeId>,
    next_connection_number: u32,
}

impl SegmentTree {
    fn empty(next_connection_number: u32) -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            leaf_order: Vec::new(),
            next_connection_number,
        }
    }

    fn push_node(&mut self, node: SegmentNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn alloc_connection_number(&mut self) -> u32 {
        let n = self.next_connection_number;
        self.next_connection_number += 1;
        n
    }

    /// Highest connection number handed out so far, plus one. Used by the
    /// coordinator to seed `EngineChannel::created_connections`.
    pub fn connections_allocated(&self) -> u32 {
        self.next_connection_number
    }

    /// Builds the tree for a fresh or recovering download (spec §4.1).
    ///
    /// Returns `(tree, recovery_mode)`; `recovery_mode` tells the caller to
    /// pin `created_connections := total_connections` to suppress dynamic
    /// spawn, exactly as spec §4.3 step 4 requires.
    pub fn build_from_missing_bytes(
        total_connections: usize,
        missing_ranges: &[Segment],
        content_length: u64,
        now_millis: u64,
    ) -> (Self, bool) {
        if missing_ranges.is_empty() {
            return (Self::empty(0), false);
        }

        let is_single_full_range =
            missing_ranges.len() == 1 && missing_ranges[0] == Segment::new(0, content_length - 1);

        if is_single_full_range {
            let mut tree = Self::empty(0);
            let connection_number = tree.alloc_connection_number();
            let root = tree.push_node(SegmentNode {
                segment: missing_ranges[0],
                parent: None,
                left: None,
                right: None,
                connection_number: Some(connection_number),
                status: SegmentStatus::Initial,
                last_update_millis: now_millis,
            });
            tree.roots.push(root);
            tree.leaf_order.push(root);

            while tree.leaf_order.len() < total_connections {
                // Repeatedly split the right-most (highest start-byte) leaf.
                let rightmost = *tree.leaf_order.last().expect("leaf_order non-empty");
                match tree.build_split(rightmost, now_millis) {
                    Ok(()) => {}
                    Err(EngineError::SegmentTooSmall) => break,
                    Err(e) => {
                        log::error!("[segment_tree] build split failed: {e}");
                        break;
                    }
                }
            }

            (tree, false)
        } else {
            // Recovery path: one independent leaf per gap, no pre-split.
            let mut tree = Self::empty(0);
            for range in missing_ranges {
                let connection_number = tree.alloc_connection_number();
                let node = tree.push_node(SegmentNode {
                    segment: *range,
                    parent: None,
                    left: None,
                    right: None,
                    connection_number: Some(connection_number),
                    status: SegmentStatus::Initial,
                    last_update_millis: now_millis,
                });
                tree.roots.push(node);
                tree.leaf_order.push(node);
            }
            (tree, true)
        }
    }

    /// Construction-time split used only by `build_from_missing_bytes`.
    /// Delegates to `split_segment_node` so the left child inherits the
    /// leaf's own connection number (spec §3 "Split rule") instead of
    /// burning a fresh one — the duplicate allocation this used to do left
    /// gaps in the allocated connection-number range. No worker exists yet
    /// at construction time, so both children start `Initial` rather than
    /// `split_segment_node`'s runtime `RefreshRequested`/`Initial` split.
    fn build_split(&mut self, leaf: NodeId, now_millis: u64) -> Result<(), EngineError> {
        let (left, right) = self.split_segment_node(leaf, true, now_millis)?;
        self.nodes[left].status = SegmentStatus::Initial;
        self.nodes[right].status = SegmentStatus::Initial;
        Ok(())
    }

    fn replace_leaf(&mut self, old: NodeId, new_leaves: &[NodeId]) {
        let pos = self
            .leaf_order
            .iter()
            .position(|&id| id == old)
            .expect("old must be a current leaf");
        self.leaf_order.splice(pos..=pos, new_leaves.iter().copied());
    }

    pub fn node(&self, id: NodeId) -> &SegmentNode {
        &self.nodes[id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut SegmentNode {
        &mut self.nodes[id]
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_order.is_empty()
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.leaf_order.iter().copied()
    }

    pub fn leaves_with_status(&self, status: SegmentStatus) -> impl Iterator<Item = NodeId> + '_ {
        self.leaf_order
            .iter()
            .copied()
            .filter(move |&id| self.nodes[id].status == status)
    }

    pub fn in_use_leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.leaves_with_status(SegmentStatus::InUse)
    }

    /// See DESIGN.md for why this always returns empty: none of this
    /// engine's leaf statuses represent a leaf that is both safely
    /// re-splittable (has undownloaded bytes left to donate) and sitting
    /// in the reuse queue at the same time. Reuse target selection falls
    /// back to `in_use_leaves` in every case this engine produces.
    pub fn in_queue_leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::empty()
    }

    /// Locates the (unique) leaf whose segment equals `segment`.
    pub fn search(&self, segment: Segment) -> Option<NodeId> {
        self.leaf_order
            .iter()
            .copied()
            .find(|&id| self.nodes[id].segment == segment)
    }

    pub fn set_status(&mut self, id: NodeId, status: SegmentStatus, now_millis: u64) {
        let node = self.node_mut(id);
        node.status = status;
        node.last_update_millis = now_millis;
    }

    pub fn set_connection_number(&mut self, id: NodeId, connection_number: u32) {
        self.node_mut(id).connection_number = Some(connection_number);
    }

    pub fn set_segment(&mut self, id: NodeId, segment: Segment) {
        self.node_mut(id).segment = segment;
    }

    /// Picks the longest leaf and splits it (spec §4.1 `split()`, used by
    /// the dynamic-spawn timer). The left child inherits the parent's
    /// connection number and is marked `RefreshRequested` (a `refreshSegment`
    /// must be sent to its worker); the right child gets a fresh connection
    /// number and `Initial` status (a new worker will be spawned for it once
    /// the refresh succeeds).
    pub fn split(&mut self, now_millis: u64) -> Result<(NodeId, NodeId), EngineError> {
        let longest = self
            .leaf_order
            .iter()
            .copied()
            .max_by_key(|&id| self.nodes[id].segment.length())
            .ok_or(EngineError::SegmentTooSmall)?;

        self.split_segment_node(longest, true, now_millis)
    }

    /// General split used by both the dynamic-spawn path (`set_connection_number
    /// = true`) and the reuse path (`false` — the caller assigns the right
    /// child's connection number to the reusing worker itself).
    ///
    /// Refuses (returns `SegmentTooSmall`) if the resulting right child
    /// would be shorter than `MINIMUM_DOWNLOAD_SEGMENT_LENGTH` (spec §3
    /// "Split rule").
    pub fn split_segment_node(
        &mut self,
        leaf: NodeId,
        set_connection_number: bool,
        now_millis: u64,
    ) -> Result<(NodeId, NodeId), EngineError> {
        let node = &self.nodes[leaf];
        if !node.is_leaf() {
            return Err(EngineError::TreeInvariant(format!(
                "split_segment_node called on non-leaf node {leaf}"
            )));
        }
        let segment = node.segment;
        let parent_conn = node.connection_number;

        let (left_seg, right_seg) = segment.split_in_half();
        if right_seg.length() < MINIMUM_DOWNLOAD_SEGMENT_LENGTH {
            return Err(EngineError::SegmentTooSmall);
        }

        let right_conn = if set_connection_number {
            Some(self.alloc_connection_number())
        } else {
            None
        };

        let left = self.push_node(SegmentNode {
            segment: left_seg,
            parent: Some(leaf),
            left: None,
            right: None,
            connection_number: parent_conn,
            status: SegmentStatus::RefreshRequested,
            last_update_millis: now_millis,
        });
        let right = self.push_node(SegmentNode {
            segment: right_seg,
            parent: Some(leaf),
            left: None,
            right: None,
            connection_number: right_conn,
            status: SegmentStatus::Initial,
            last_update_millis: now_millis,
        });

        {
            let node = &mut self.nodes[leaf];
            node.left = Some(left);
            node.right = Some(right);
            node.status = SegmentStatus::OutDated;
            node.connection_number = None;
        }

        self.replace_leaf(leaf, &[left, right]);
        Ok((left, right))
    }

    /// Collapses a failed split: reinstates `parent` at the leaf position
    /// its left child occupied, drops both children from the leaf set, and
    /// clears the parent's child pointers (spec §4.3
    /// `REFRESH_SEGMENT_REFUSED` / `REUSE__REFUSED` handling).
    pub fn collapse(&mut self, left_child: NodeId, now_millis: u64) -> Result<NodeId, EngineError> {
        let parent = self.nodes[left_child]
            .parent
            .ok_or_else(|| EngineError::TreeInvariant("collapse target has no parent".into()))?;
        let right_child = self.nodes[parent]
            .right
            .ok_or_else(|| EngineError::TreeInvariant("parent missing right child".into()))?;
        debug_assert_eq!(self.nodes[parent].left, Some(left_child));

        let pos = self
            .leaf_order
            .iter()
            .position(|&id| id == left_child)
            .ok_or_else(|| EngineError::TreeInvariant("left child not in leaf set".into()))?;
        // Right child must immediately follow the left child in leaf order.
        if self.leaf_order.get(pos + 1).copied() != Some(right_child) {
            return Err(EngineError::TreeInvariant(
                "right child not adjacent to left child in leaf order".into(),
            ));
        }
        self.leaf_order.splice(pos..=pos + 1, std::iter::once(parent));

        {
            let node = &mut self.nodes[parent];
            node.left = None;
            node.right = None;
            node.status = SegmentStatus::InUse;
            node.last_update_millis = now_millis;
            // parent's connection number is restored to the left child's —
            // the original worker never actually stopped serving it.
        }
        let restored_conn = self.nodes[left_child].connection_number;
        self.nodes[parent].connection_number = restored_conn;

        Ok(parent)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::SegmentStatus;
    use super::*;

    #[test]
    fn build_from_single_full_range_covers_exactly_with_n_parts() {
        let (tree, recovery) =
            SegmentTree::build_from_missing_bytes(4, &[Segment::new(0, 4 * 1_048_576 - 1)], 4 * 1_048_576, 0);
        assert!(!recovery);
        assert_eq!(tree.leaf_count(), 4);

        let mut segs: Vec<Segment> = tree.leaves().map(|id| tree.node(id).segment).collect();
        segs.sort_by_key(|s| s.start);
        assert_eq!(segs[0].start, 0);
        assert_eq!(segs.last().unwrap().end, 4 * 1_048_576 - 1);
        // Contiguous, non-overlapping.
        for w in segs.windows(2) {
            assert_eq!(w[0].end + 1, w[1].start);
        }
        // Distinct connection numbers in [0, N).
        let mut conns: Vec<u32> = tree
            .leaves()
            .map(|id| tree.node(id).connection_number.unwrap())
            .collect();
        conns.sort();
        assert_eq!(conns, vec![0, 1, 2, 3]);
    }

    #[test]
    fn recovery_path_builds_one_leaf_per_gap_without_presplitting() {
        let ranges = vec![Segment::new(10, 20), Segment::new(100, 200)];
        let (tree, recovery) = SegmentTree::build_from_missing_bytes(4, &ranges, 1000, 0);
        assert!(recovery);
        assert_eq!(tree.leaf_count(), 2);
        let mut conns: Vec<u32> = tree
            .leaves()
            .map(|id| tree.node(id).connection_number.unwrap())
            .collect();
        conns.sort();
        assert_eq!(conns, vec![0, 1]);
    }

    #[test]
    fn empty_missing_ranges_yields_empty_tree() {
        let (tree, recovery) = SegmentTree::build_from_missing_bytes(4, &[], 1000, 0);
        assert!(!recovery);
        assert!(tree.is_empty());
    }

    #[test]
    fn split_refuses_below_minimum_length() {
        let (mut tree, _) =
            SegmentTree::build_from_missing_bytes(1, &[Segment::new(0, MINIMUM_DOWNLOAD_SEGMENT_LENGTH * 2 - 1)], MINIMUM_DOWNLOAD_SEGMENT_LENGTH * 2, 0);
        let leaf = tree.leaves().next().unwrap();
        // Exactly 2x minimum splits successfully.
        let result = tree.split_segment_node(leaf, true, 0);
        assert!(result.is_ok());
    }

    #[test]
    fn split_one_byte_under_two_x_minimum_refuses() {
        let (mut tree, _) = SegmentTree::build_from_missing_bytes(
            1,
            &[Segment::new(0, MINIMUM_DOWNLOAD_SEGMENT_LENGTH * 2 - 2)],
            MINIMUM_DOWNLOAD_SEGMENT_LENGTH * 2 - 1,
            0,
        );
        let leaf = tree.leaves().next().unwrap();
        let result = tree.split_segment_node(leaf, true, 0);
        assert!(matches!(result, Err(EngineError::SegmentTooSmall)));
    }

    #[test]
    fn split_then_refuse_returns_leaf_count_to_original() {
        let (mut tree, _) = SegmentTree::build_from_missing_bytes(1, &[Segment::new(0, 10_000_000)], 10_000_001, 0);
        let before = tree.leaf_count();
        let leaf = tree.leaves().next().unwrap();
        let (left, _right) = tree.split_segment_node(leaf, true, 0).unwrap();
        assert_eq!(tree.leaf_count(), before + 1);

        let restored = tree.collapse(left, 0).unwrap();
        assert_eq!(tree.leaf_count(), before);
        assert_eq!(tree.node(restored).segment, Segment::new(0, 10_000_000));
        assert_eq!(tree.node(restored).status, SegmentStatus::InUse);
    }

    #[test]
    fn search_finds_exact_leaf_segment() {
        let (tree, _) = SegmentTree::build_from_missing_bytes(4, &[Segment::new(0, 4_000_000 - 1)], 4_000_000, 0);
        let any_leaf = tree.leaves().next().unwrap();
        let seg = tree.node(any_leaf).segment;
        assert_eq!(tree.search(seg), Some(any_leaf));
        assert_eq!(tree.search(Segment::new(999_999_990, 999_999_999)), None);
    }
}
