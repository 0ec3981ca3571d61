//! Tree-growth policy: where a newly joining member attaches.

use super::tree::{TreeArena, TreeError};
use crate::domain::{MemberId, Side, TreeNode};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// Shallowest empty slot under the referrer, left before right.
    #[default]
    Spillover,
    /// Bottom of the referrer's outermost leg on the preferred side.
    OuterLeg,
    /// The referrer's own slots only.
    Direct,
}

/// An empty child slot chosen for a new member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSlot {
    pub parent: MemberId,
    pub side: Side,
    pub depth: u32,
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("referrer {0} does not exist or is not placed")]
    ReferrerNotFound(MemberId),
    #[error("member {0} is already placed")]
    AlreadyPlaced(MemberId),
    #[error("tree already has a root")]
    RootExists,
    #[error("no free slot under {0} for the configured policy")]
    NoSlotAvailable(MemberId),
    #[error("placement would exceed maximum depth {0}")]
    MaxDepthReached(u32),
    #[error("tree is full ({0} members)")]
    TreeFull(u64),
    #[error("{side} slot of {parent} was taken concurrently")]
    SlotTaken { parent: MemberId, side: Side },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct PlacementResolver {
    policy: PlacementPolicy,
    max_depth: Option<u32>,
}

impl PlacementResolver {
    pub fn new(policy: PlacementPolicy, max_depth: Option<u32>) -> Self {
        Self { policy, max_depth }
    }

    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Choose the slot for a member introduced by `referrer`.
    ///
    /// `arena` must contain at least the referrer's subtree.
    pub fn resolve(
        &self,
        arena: &TreeArena,
        referrer: &MemberId,
        preferred: Option<Side>,
    ) -> Result<PlacementSlot, PlacementError> {
        let start = arena
            .get(referrer)
            .ok_or_else(|| PlacementError::ReferrerNotFound(referrer.clone()))?;

        let slot = match self.policy {
            PlacementPolicy::Direct => {
                let first = preferred.unwrap_or(Side::Left);
                [first, first.opposite()]
                    .into_iter()
                    .find(|side| start.child(*side).is_none())
                    .map(|side| slot_under(start, side))
            }
            PlacementPolicy::OuterLeg => {
                Some(outer_leg(arena, start, preferred.unwrap_or(Side::Left))?)
            }
            PlacementPolicy::Spillover => match preferred {
                Some(side) => match start.child(side) {
                    None => Some(slot_under(start, side)),
                    Some(child) => {
                        let leg = arena
                            .get(child)
                            .ok_or_else(|| missing_child(child, referrer))?;
                        shallowest_free(arena, leg)?
                    }
                },
                None => shallowest_free(arena, start)?,
            },
        };

        let slot = slot.ok_or_else(|| PlacementError::NoSlotAvailable(referrer.clone()))?;
        if let Some(max) = self.max_depth {
            if slot.depth > max {
                return Err(PlacementError::MaxDepthReached(max));
            }
        }
        Ok(slot)
    }
}

fn slot_under(node: &TreeNode, side: Side) -> PlacementSlot {
    PlacementSlot {
        parent: node.member_id.clone(),
        side,
        depth: node.depth + 1,
    }
}

fn missing_child(child: &MemberId, parent: &MemberId) -> TreeError {
    TreeError::Inconsistent(format!("child {} of {} missing", child, parent))
}

/// Breadth-first from `from`; the first empty slot found is the shallowest, left first.
fn shallowest_free(
    arena: &TreeArena,
    from: &TreeNode,
) -> Result<Option<PlacementSlot>, TreeError> {
    let mut queue = VecDeque::from([from]);
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        if visited > arena.len() {
            return Err(TreeError::Cycle(from.member_id.clone()));
        }
        for side in [Side::Left, Side::Right] {
            match node.child(side) {
                None => return Ok(Some(slot_under(node, side))),
                Some(child) => {
                    let child_node = arena
                        .get(child)
                        .ok_or_else(|| missing_child(child, &node.member_id))?;
                    queue.push_back(child_node);
                }
            }
        }
    }
    Ok(None)
}

/// Follow `side` children from `from` until the slot on that side is empty.
fn outer_leg(arena: &TreeArena, from: &TreeNode, side: Side) -> Result<PlacementSlot, TreeError> {
    let mut current = from;
    for _ in 0..=arena.len() {
        match current.child(side) {
            None => return Ok(slot_under(current, side)),
            Some(child) => {
                current = arena
                    .get(child)
                    .ok_or_else(|| missing_child(child, &current.member_id))?;
            }
        }
    }
    Err(TreeError::Cycle(from.member_id.clone()))
}
