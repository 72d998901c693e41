//! Arena-based segment tree (spec component C2, §3, §4.1).

mod node;
mod segment_tree;

pub use node::{NodeId, SegmentNode, SegmentStatus};
pub use segment_tree::SegmentTree;
