//! Id-indexed arena of tree nodes.
//!
//! Relations are member ids looked up in the arena. The arena is the in-memory view the
//! placement resolver walks and the structure invariants are checked against.

use crate::domain::{MemberId, Side, TreeNode};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("member {0} has no tree placement")]
    NotFound(MemberId),
    #[error("parent chain of {0} does not terminate at the root")]
    Cycle(MemberId),
    #[error("tree inconsistency: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Default)]
pub struct TreeArena {
    nodes: HashMap<MemberId, TreeNode>,
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = TreeNode>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.member_id.clone(), n))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &MemberId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.values().find(|n| n.is_root())
    }

    /// Insert the root of an empty arena.
    pub fn insert_root(&mut self, member_id: MemberId) -> Result<&TreeNode, TreeError> {
        if !self.nodes.is_empty() {
            return Err(TreeError::Inconsistent("root already exists".to_string()));
        }
        let node = TreeNode::placed(member_id.clone(), None, None, 0);
        Ok(self.nodes.entry(member_id).or_insert(node))
    }

    /// Attach `child` under `parent` on `side`. The slot must be empty.
    pub fn attach(
        &mut self,
        child: MemberId,
        parent: &MemberId,
        side: Side,
    ) -> Result<&TreeNode, TreeError> {
        if self.nodes.contains_key(&child) {
            return Err(TreeError::Inconsistent(format!("{} already placed", child)));
        }
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| TreeError::NotFound(parent.clone()))?;
        if let Some(existing) = parent_node.child(side) {
            return Err(TreeError::Inconsistent(format!(
                "{} slot of {} already holds {}",
                side, parent, existing
            )));
        }
        parent_node.set_child(side, child.clone());
        let depth = parent_node.depth + 1;
        let node = TreeNode::placed(child.clone(), Some(parent.clone()), Some(side), depth);
        Ok(self.nodes.entry(child).or_insert(node))
    }

    /// Verify the proper-binary-tree invariants over the whole arena.
    ///
    /// Exactly one root; every parent/child link is mirrored; depths are consistent;
    /// every node is reachable from the root along a unique path.
    pub fn check_invariants(&self) -> Result<(), TreeError> {
        if self.nodes.is_empty() {
            return Ok(());
        }

        let roots: Vec<_> = self.nodes.values().filter(|n| n.is_root()).collect();
        if roots.len() != 1 {
            return Err(TreeError::Inconsistent(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        let root = roots[0];
        if root.side.is_some() || root.depth != 0 {
            return Err(TreeError::Inconsistent(format!(
                "root {} must have no side and depth 0",
                root.member_id
            )));
        }

        for node in self.nodes.values() {
            if let Some(parent_id) = &node.parent {
                let side = node.side.ok_or_else(|| {
                    TreeError::Inconsistent(format!("{} has a parent but no side", node.member_id))
                })?;
                let parent = self
                    .nodes
                    .get(parent_id)
                    .ok_or_else(|| TreeError::NotFound(parent_id.clone()))?;
                if parent.child(side) != Some(&node.member_id) {
                    return Err(TreeError::Inconsistent(format!(
                        "{} claims {} slot of {} but the parent does not point back",
                        node.member_id, side, parent_id
                    )));
                }
                if node.depth != parent.depth + 1 {
                    return Err(TreeError::Inconsistent(format!(
                        "{} depth {} under parent depth {}",
                        node.member_id, node.depth, parent.depth
                    )));
                }
            }
            for side in [Side::Left, Side::Right] {
                if let Some(child_id) = node.child(side) {
                    let child = self
                        .nodes
                        .get(child_id)
                        .ok_or_else(|| TreeError::NotFound(child_id.clone()))?;
                    if child.parent.as_ref() != Some(&node.member_id) || child.side != Some(side) {
                        return Err(TreeError::Inconsistent(format!(
                            "{} lists {} as {} child but the child disagrees",
                            node.member_id, child_id, side
                        )));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root.member_id.clone()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                return Err(TreeError::Cycle(id));
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.left_child.iter().cloned());
                queue.extend(node.right_child.iter().cloned());
            }
        }
        if seen.len() != self.nodes.len() {
            return Err(TreeError::Inconsistent(format!(
                "{} of {} nodes unreachable from the root",
                self.nodes.len() - seen.len(),
                self.nodes.len()
            )));
        }
        Ok(())
    }
}
