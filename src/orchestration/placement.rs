//! Placement: inserts new members into the persisted tree.

use crate::config::PlacementConfig;
use crate::db::Repository;
use crate::domain::{Member, MemberId, NewMember, TimeMs, TreeNode};
use crate::engine::{PlacementError, PlacementResolver, TreeArena};
use std::sync::Arc;
use tracing::info;

/// Places members according to the configured policy and limits.
#[derive(Debug, Clone)]
pub struct Placer {
    repo: Arc<Repository>,
    resolver: PlacementResolver,
    max_size: Option<u64>,
}

impl Placer {
    pub fn new(repo: Arc<Repository>, config: PlacementConfig) -> Self {
        Self {
            repo,
            resolver: PlacementResolver::new(config.policy, config.max_depth),
            max_size: config.max_size,
        }
    }

    /// Create the root of an empty tree.
    pub async fn place_root(&self, new_member: NewMember) -> Result<TreeNode, PlacementError> {
        let now = TimeMs::now();
        let member = Member {
            id: new_member.id.clone(),
            referrer: None,
            rank: new_member.rank,
            package_amount: new_member.package_amount,
            joined_at: now,
        };

        let mut tx = self.repo.begin().await?;
        if !self.repo.insert_member(&mut tx, &member).await? {
            return Err(PlacementError::AlreadyPlaced(member.id));
        }
        if self.repo.has_root(&mut tx).await? {
            return Err(PlacementError::RootExists);
        }

        let node = TreeNode::placed(member.id.clone(), None, None, 0);
        self.repo.create_node(&mut tx, &node, now).await?;
        tx.commit().await?;

        info!(member_id = %node.member_id, "root placed");
        Ok(node)
    }

    /// Place `new_member`, introduced by `referrer`, at the slot the policy selects.
    ///
    /// Member insert, node insert and the parent's slot claim commit together.
    pub async fn place(
        &self,
        new_member: NewMember,
        referrer: &MemberId,
    ) -> Result<TreeNode, PlacementError> {
        let now = TimeMs::now();
        let mut tx = self.repo.begin().await?;

        // Starting with a write takes the database write lock for the whole placement.
        if !self.repo.touch_node(&mut tx, referrer, now).await? {
            return Err(PlacementError::ReferrerNotFound(referrer.clone()));
        }

        let member = Member {
            id: new_member.id.clone(),
            referrer: Some(referrer.clone()),
            rank: new_member.rank,
            package_amount: new_member.package_amount,
            joined_at: now,
        };
        if !self.repo.insert_member(&mut tx, &member).await? {
            return Err(PlacementError::AlreadyPlaced(member.id));
        }

        if let Some(max) = self.max_size {
            if self.repo.count_nodes(&mut tx).await? >= max {
                return Err(PlacementError::TreeFull(max));
            }
        }

        let arena = TreeArena::from_nodes(self.repo.load_subtree(&mut tx, referrer).await?);
        let slot = self
            .resolver
            .resolve(&arena, referrer, new_member.preferred_side)?;

        let node = TreeNode::placed(
            member.id.clone(),
            Some(slot.parent.clone()),
            Some(slot.side),
            slot.depth,
        );
        self.repo.create_node(&mut tx, &node, now).await?;
        if !self
            .repo
            .claim_child_slot(&mut tx, &slot.parent, slot.side, &node.member_id, now)
            .await?
        {
            return Err(PlacementError::SlotTaken {
                parent: slot.parent,
                side: slot.side,
            });
        }
        tx.commit().await?;

        info!(
            member_id = %node.member_id,
            referrer = %referrer,
            parent = %slot.parent,
            side = %slot.side,
            depth = node.depth,
            policy = ?self.resolver.policy(),
            "member placed"
        );
        Ok(node)
    }
}
