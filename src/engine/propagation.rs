//! Upward PV propagation planning.

use crate::domain::{MemberId, Pv, Side};
use serde::{Deserialize, Serialize};

/// One hop on the path from a member to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorStep {
    pub ancestor: MemberId,
    /// Side of `ancestor` through which the path arrived.
    pub via: Side,
}

/// A counter increment for one ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvIncrement {
    pub member_id: MemberId,
    pub side: Side,
    pub amount: Pv,
    /// 1 for the direct parent.
    pub level: u32,
}

/// Plan the increments for `amount` PV travelling up `path`.
///
/// `max_depth` caps the number of ancestors credited; None credits up to the root.
pub fn plan_increments(
    path: &[AncestorStep],
    amount: Pv,
    max_depth: Option<u32>,
) -> Vec<PvIncrement> {
    if amount.is_zero() {
        return Vec::new();
    }
    let limit = max_depth.map(|d| d as usize).unwrap_or(usize::MAX);

    path.iter()
        .take(limit)
        .enumerate()
        .map(|(i, step)| PvIncrement {
            member_id: step.ancestor.clone(),
            side: step.via,
            amount,
            level: (i + 1) as u32,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MemberId {
        MemberId::new(s)
    }

    fn path() -> Vec<AncestorStep> {
        vec![
            AncestorStep { ancestor: id("p1"), via: Side::Left },
            AncestorStep { ancestor: id("p2"), via: Side::Right },
            AncestorStep { ancestor: id("root"), via: Side::Right },
        ]
    }

    #[test]
    fn test_unlimited_reaches_root() {
        let plan = plan_increments(&path(), Pv(10), None);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].member_id, id("p1"));
        assert_eq!(plan[0].side, Side::Left);
        assert_eq!(plan[2].member_id, id("root"));
        assert_eq!(plan[2].level, 3);
        assert!(plan.iter().all(|inc| inc.amount == Pv(10)));
    }

    #[test]
    fn test_max_depth_truncates() {
        let plan = plan_increments(&path(), Pv(10), Some(2));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.last().unwrap().member_id, id("p2"));
        assert!(plan_increments(&path(), Pv(10), Some(0)).is_empty());
    }

    #[test]
    fn test_zero_amount_plans_nothing() {
        assert!(plan_increments(&path(), Pv::ZERO, None).is_empty());
    }
}
