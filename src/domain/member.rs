//! Network members and their tree placement records.

use crate::domain::{CycleId, Decimal, MemberId, Pv, Rank, Side, TimeMs};
use serde::{Deserialize, Serialize};

/// A network member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    /// The member who introduced this one. None only for the root.
    pub referrer: Option<MemberId>,
    /// Plan rank; selects the per-cycle cap.
    pub rank: Rank,
    /// Joining package price; base of the lifetime cap.
    pub package_amount: Decimal,
    pub joined_at: TimeMs,
}

/// A member joining the network, before placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMember {
    pub id: MemberId,
    pub rank: Rank,
    pub package_amount: Decimal,
    /// Leg requested by the referrer, if any.
    pub preferred_side: Option<Side>,
}

impl NewMember {
    pub fn new(id: MemberId, rank: Rank, package_amount: Decimal) -> Self {
        Self {
            id,
            rank,
            package_amount,
            preferred_side: None,
        }
    }

    pub fn with_preferred_side(mut self, side: Side) -> Self {
        self.preferred_side = Some(side);
        self
    }
}

/// Leg counters of one member as they stood when a cycle started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegSnapshot {
    pub left_pv: Pv,
    pub right_pv: Pv,
}

/// Placement record and PV counters of one member.
///
/// Parent/child relations are ids resolved through the store, never references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub member_id: MemberId,
    pub parent: Option<MemberId>,
    /// Slot under `parent`; None for the root.
    pub side: Option<Side>,
    pub left_child: Option<MemberId>,
    pub right_child: Option<MemberId>,
    pub depth: u32,
    pub left_pv: Pv,
    pub right_pv: Pv,
    pub lifetime_matched_pv: Pv,
    pub lifetime_income: Decimal,
    pub daily_matched_pv: Pv,
    pub last_settled_cycle: Option<CycleId>,
}

impl TreeNode {
    /// A freshly placed node with zeroed counters.
    pub fn placed(
        member_id: MemberId,
        parent: Option<MemberId>,
        side: Option<Side>,
        depth: u32,
    ) -> Self {
        Self {
            member_id,
            parent,
            side,
            left_child: None,
            right_child: None,
            depth,
            left_pv: Pv::ZERO,
            right_pv: Pv::ZERO,
            lifetime_matched_pv: Pv::ZERO,
            lifetime_income: Decimal::zero(),
            daily_matched_pv: Pv::ZERO,
            last_settled_cycle: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn child(&self, side: Side) -> Option<&MemberId> {
        match side {
            Side::Left => self.left_child.as_ref(),
            Side::Right => self.right_child.as_ref(),
        }
    }

    pub fn set_child(&mut self, side: Side, child: MemberId) {
        match side {
            Side::Left => self.left_child = Some(child),
            Side::Right => self.right_child = Some(child),
        }
    }

    pub fn pv(&self, side: Side) -> Pv {
        match side {
            Side::Left => self.left_pv,
            Side::Right => self.right_pv,
        }
    }

    /// PV matchable right now: the weaker leg.
    pub fn matchable_pv(&self) -> Pv {
        self.left_pv.min(self.right_pv)
    }

    /// The node with each leg limited to `snapshot`.
    ///
    /// PV that arrived after the snapshot stays in the legs for the next cycle.
    pub fn capped_to(&self, snapshot: LegSnapshot) -> TreeNode {
        TreeNode {
            left_pv: self.left_pv.min(snapshot.left_pv),
            right_pv: self.right_pv.min(snapshot.right_pv),
            ..self.clone()
        }
    }

    /// PV already matched within `cycle`; zero once a new cycle begins.
    pub fn matched_in_cycle(&self, cycle: &CycleId) -> Pv {
        if self.last_settled_cycle.as_ref() == Some(cycle) {
            self.daily_matched_pv
        } else {
            Pv::ZERO
        }
    }
}
