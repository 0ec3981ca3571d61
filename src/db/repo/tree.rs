//! Members, tree placement, PV counters and consumed PV events.

use crate::domain::{CycleId, Member, MemberId, Pv, PvEvent, Rank, Side, TimeMs, TreeNode};
use crate::engine::{AncestorStep, CounterUpdate};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decimal_column, decode_error, pv_column, pv_param, side_column, Repository};

const NODE_COLUMNS: &str = "member_id, parent_id, side, left_child, right_child, depth, \
     left_pv, right_pv, lifetime_matched_pv, lifetime_income, daily_matched_pv, last_settled_cycle";

/// Ancestors of a member as stored, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorPath {
    pub steps: Vec<AncestorStep>,
    /// False when the walk stopped at the hop limit before finding the root.
    pub reached_root: bool,
}

fn node_from_row(row: &SqliteRow) -> Result<TreeNode, sqlx::Error> {
    let depth: i64 = row.try_get("depth")?;
    Ok(TreeNode {
        member_id: MemberId::new(row.try_get::<String, _>("member_id")?),
        parent: row.try_get::<Option<String>, _>("parent_id")?.map(MemberId::new),
        side: side_column(row, "side")?,
        left_child: row.try_get::<Option<String>, _>("left_child")?.map(MemberId::new),
        right_child: row.try_get::<Option<String>, _>("right_child")?.map(MemberId::new),
        depth: u32::try_from(depth).map_err(|e| decode_error("depth", e))?,
        left_pv: pv_column(row, "left_pv")?,
        right_pv: pv_column(row, "right_pv")?,
        lifetime_matched_pv: pv_column(row, "lifetime_matched_pv")?,
        lifetime_income: decimal_column(row, "lifetime_income")?,
        daily_matched_pv: pv_column(row, "daily_matched_pv")?,
        last_settled_cycle: row
            .try_get::<Option<String>, _>("last_settled_cycle")?
            .map(CycleId::new),
    })
}

fn member_from_row(row: &SqliteRow) -> Result<Member, sqlx::Error> {
    Ok(Member {
        id: MemberId::new(row.try_get::<String, _>("member_id")?),
        referrer: row.try_get::<Option<String>, _>("referrer_id")?.map(MemberId::new),
        rank: Rank::new(&row.try_get::<String, _>("rank")?),
        package_amount: decimal_column(row, "package_amount")?,
        joined_at: TimeMs::new(row.try_get("joined_at_ms")?),
    })
}

impl Repository {
    // =========================================================================
    // Members
    // =========================================================================

    /// Insert a member. Returns false if the id already exists.
    pub async fn insert_member(
        &self,
        conn: &mut SqliteConnection,
        member: &Member,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO members (member_id, referrer_id, rank, package_amount, joined_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(member_id) DO NOTHING
            "#,
        )
        .bind(member.id.as_str())
        .bind(member.referrer.as_ref().map(|r| r.as_str()))
        .bind(member.rank.as_str())
        .bind(member.package_amount.to_canonical_string())
        .bind(member.joined_at.as_i64())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_member(&self, id: &MemberId) -> Result<Option<Member>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.load_member(&mut conn, id).await
    }

    pub async fn load_member(
        &self,
        conn: &mut SqliteConnection,
        id: &MemberId,
    ) -> Result<Option<Member>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT member_id, referrer_id, rank, package_amount, joined_at_ms
            FROM members
            WHERE member_id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(member_from_row).transpose()
    }

    // =========================================================================
    // Tree nodes
    // =========================================================================

    pub async fn get_node(&self, id: &MemberId) -> Result<Option<TreeNode>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.load_node(&mut conn, id).await
    }

    pub async fn load_node(
        &self,
        conn: &mut SqliteConnection,
        id: &MemberId,
    ) -> Result<Option<TreeNode>, sqlx::Error> {
        let sql = format!("SELECT {} FROM tree_nodes WHERE member_id = ?", NODE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    /// Insert a freshly placed node. The parent's child slot is claimed separately.
    pub async fn create_node(
        &self,
        conn: &mut SqliteConnection,
        node: &TreeNode,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tree_nodes (member_id, parent_id, side, depth, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.member_id.as_str())
        .bind(node.parent.as_ref().map(|p| p.as_str()))
        .bind(node.side.map(|s| s.as_str()))
        .bind(i64::from(node.depth))
        .bind(now.as_i64())
        .bind(now.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Compare-and-set the empty `side` slot of `parent` to `child`.
    ///
    /// Returns false if the slot is already occupied.
    pub async fn claim_child_slot(
        &self,
        conn: &mut SqliteConnection,
        parent: &MemberId,
        side: Side,
        child: &MemberId,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let sql = match side {
            Side::Left => {
                "UPDATE tree_nodes SET left_child = ?, updated_at_ms = ? \
                 WHERE member_id = ? AND left_child IS NULL"
            }
            Side::Right => {
                "UPDATE tree_nodes SET right_child = ?, updated_at_ms = ? \
                 WHERE member_id = ? AND right_child IS NULL"
            }
        };
        let result = sqlx::query(sql)
            .bind(child.as_str())
            .bind(now.as_i64())
            .bind(parent.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn has_root(&self, conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM tree_nodes WHERE parent_id IS NULL LIMIT 1")
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    pub async fn count_nodes(&self, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tree_nodes")
            .fetch_one(&mut *conn)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// The subtree rooted at `root`, `root` included.
    ///
    /// `UNION` deduplicates, so a corrupted cyclic link cannot make the walk diverge.
    pub async fn load_subtree(
        &self,
        conn: &mut SqliteConnection,
        root: &MemberId,
    ) -> Result<Vec<TreeNode>, sqlx::Error> {
        let sql = format!(
            r#"
            WITH RECURSIVE subtree(member_id) AS (
                SELECT member_id FROM tree_nodes WHERE member_id = ?
                UNION
                SELECT t.member_id FROM tree_nodes t JOIN subtree s ON t.parent_id = s.member_id
            )
            SELECT {} FROM tree_nodes WHERE member_id IN (SELECT member_id FROM subtree)
            "#,
            NODE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(root.as_str())
            .fetch_all(&mut *conn)
            .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Walk parent links from `member` for at most `hop_limit` ancestors.
    ///
    /// Returns None if `member` has no placement.
    pub async fn ancestor_path(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        hop_limit: u64,
    ) -> Result<Option<AncestorPath>, sqlx::Error> {
        let limit = i64::try_from(hop_limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE path(member_id, parent_id, side, hops) AS (
                SELECT member_id, parent_id, side, 0 FROM tree_nodes WHERE member_id = ?
                UNION ALL
                SELECT t.member_id, t.parent_id, t.side, p.hops + 1
                FROM tree_nodes t JOIN path p ON t.member_id = p.parent_id
                WHERE p.hops < ?
            )
            SELECT member_id, parent_id, side, hops FROM path ORDER BY hops
            "#,
        )
        .bind(member.as_str())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut steps = Vec::with_capacity(rows.len());
        let mut reached_root = false;
        for row in &rows {
            let hops: i64 = row.try_get("hops")?;
            let parent: Option<String> = row.try_get("parent_id")?;
            match parent {
                None => {
                    reached_root = true;
                    break;
                }
                Some(parent) if hops < limit => {
                    let via = side_column(row, "side")?
                        .ok_or_else(|| decode_error("side", "non-root node without a side"))?;
                    steps.push(AncestorStep {
                        ancestor: MemberId::new(parent),
                        via,
                    });
                }
                Some(_) => break,
            }
        }
        Ok(Some(AncestorPath { steps, reached_root }))
    }

    // =========================================================================
    // PV counters
    // =========================================================================

    /// Atomically add `amount` to one leg.
    ///
    /// Returns false if the node does not exist or the leg would pass [`Pv::MAX`]. The
    /// guard keeps SQLite from promoting the column to REAL on overflow.
    pub async fn increment_pv(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        side: Side,
        amount: Pv,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let sql = match side {
            Side::Left => {
                r#"
                UPDATE tree_nodes SET left_pv = left_pv + ?, updated_at_ms = ?
                WHERE member_id = ? AND left_pv <= 9223372036854775807 - ?
                "#
            }
            Side::Right => {
                r#"
                UPDATE tree_nodes SET right_pv = right_pv + ?, updated_at_ms = ?
                WHERE member_id = ? AND right_pv <= 9223372036854775807 - ?
                "#
            }
        };
        let amount = pv_param("amount", amount)?;
        let result = sqlx::query(sql)
            .bind(amount)
            .bind(now.as_i64())
            .bind(member.as_str())
            .bind(amount)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Subtract `amount` from both legs, only if both hold at least `amount`.
    ///
    /// Returns false when the guard rejects the write; the counters are never clamped.
    pub async fn decrement_pv(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Pv,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let amount = pv_param("amount", amount)?;
        let result = sqlx::query(
            r#"
            UPDATE tree_nodes
            SET left_pv = left_pv - ?, right_pv = right_pv - ?, updated_at_ms = ?
            WHERE member_id = ? AND left_pv >= ? AND right_pv >= ?
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(now.as_i64())
        .bind(member.as_str())
        .bind(amount)
        .bind(amount)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the capping counters produced by a settlement.
    pub async fn update_settlement_counters(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        counters: &CounterUpdate,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let daily = pv_param("daily_matched_pv", counters.daily_matched_pv)?;
        let lifetime = pv_param("lifetime_matched_pv", counters.lifetime_matched_pv)?;
        let result = sqlx::query(
            r#"
            UPDATE tree_nodes
            SET daily_matched_pv = ?, lifetime_matched_pv = ?, lifetime_income = ?,
                last_settled_cycle = ?, updated_at_ms = ?
            WHERE member_id = ?
            "#,
        )
        .bind(daily)
        .bind(lifetime)
        .bind(counters.lifetime_income.to_canonical_string())
        .bind(counters.cycle.as_str())
        .bind(now.as_i64())
        .bind(member.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Bump `updated_at_ms` so the enclosing transaction takes the write lock first.
    ///
    /// Returns false if the member has no placement.
    pub async fn touch_node(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE tree_nodes SET updated_at_ms = ? WHERE member_id = ?")
            .bind(now.as_i64())
            .bind(member.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // PV events
    // =========================================================================

    /// Archive a consumed event. Returns false if the key was already consumed.
    pub async fn record_consumed_event(
        &self,
        conn: &mut SqliteConnection,
        event: &PvEvent,
        ancestors_credited: usize,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let amount = pv_param("amount", event.amount)?;
        let result = sqlx::query(
            r#"
            INSERT INTO pv_events
                (event_key, source_id, amount, time_ms, ancestors_credited, consumed_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_key) DO NOTHING
            "#,
        )
        .bind(event.event_key.as_str())
        .bind(event.source.as_str())
        .bind(amount)
        .bind(event.time_ms.as_i64())
        .bind(i64::try_from(ancestors_credited).unwrap_or(i64::MAX))
        .bind(now.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_event_consumed(&self, event_key: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM pv_events WHERE event_key = ?")
            .bind(event_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::Decimal;

    fn member(id: &str, referrer: Option<&str>) -> Member {
        Member {
            id: MemberId::new(id),
            referrer: referrer.map(MemberId::new),
            rank: Rank::new("basic"),
            package_amount: Decimal::from_str_canonical("100").unwrap(),
            joined_at: TimeMs::new(1),
        }
    }

    /// root -> a (L) -> b (R)
    async fn seed(repo: &Repository) {
        let mut tx = repo.begin().await.unwrap();
        for (id, referrer) in [("root", None), ("a", Some("root")), ("b", Some("a"))] {
            assert!(repo.insert_member(&mut tx, &member(id, referrer)).await.unwrap());
        }
        let root = TreeNode::placed(MemberId::new("root"), None, None, 0);
        let child = |id: &str, parent: &str, side: Side, depth: u32| {
            TreeNode::placed(MemberId::new(id), Some(MemberId::new(parent)), Some(side), depth)
        };
        let a = child("a", "root", Side::Left, 1);
        let b = child("b", "a", Side::Right, 2);
        for node in [&root, &a, &b] {
            repo.create_node(&mut tx, node, TimeMs::new(1)).await.unwrap();
        }
        assert!(repo
            .claim_child_slot(&mut tx, &root.member_id, Side::Left, &a.member_id, TimeMs::new(1))
            .await
            .unwrap());
        assert!(repo
            .claim_child_slot(&mut tx, &a.member_id, Side::Right, &b.member_id, TimeMs::new(1))
            .await
            .unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_round_trip_and_links() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;

        let a = repo.get_node(&MemberId::new("a")).await.unwrap().unwrap();
        assert_eq!(a.parent, Some(MemberId::new("root")));
        assert_eq!(a.side, Some(Side::Left));
        assert_eq!(a.right_child, Some(MemberId::new("b")));
        assert_eq!(a.depth, 1);
        assert!(repo.get_node(&MemberId::new("ghost")).await.unwrap().is_none());

        let m = repo.get_member(&MemberId::new("b")).await.unwrap().unwrap();
        assert_eq!(m.referrer, Some(MemberId::new("a")));
    }

    #[tokio::test]
    async fn test_claim_child_slot_is_compare_and_set() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;

        let mut conn = repo.pool().acquire().await.unwrap();
        let taken = repo
            .claim_child_slot(
                &mut conn,
                &MemberId::new("root"),
                Side::Left,
                &MemberId::new("b"),
                TimeMs::new(2),
            )
            .await
            .unwrap();
        assert!(!taken);
    }

    #[tokio::test]
    async fn test_ancestor_path_and_subtree() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;
        let mut conn = repo.pool().acquire().await.unwrap();

        let path = repo
            .ancestor_path(&mut conn, &MemberId::new("b"), 10)
            .await
            .unwrap()
            .unwrap();
        assert!(path.reached_root);
        assert_eq!(
            path.steps,
            vec![
                AncestorStep { ancestor: MemberId::new("a"), via: Side::Right },
                AncestorStep { ancestor: MemberId::new("root"), via: Side::Left },
            ]
        );

        let short = repo
            .ancestor_path(&mut conn, &MemberId::new("b"), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(short.steps.len(), 1);
        assert!(!short.reached_root);

        assert!(repo
            .ancestor_path(&mut conn, &MemberId::new("ghost"), 10)
            .await
            .unwrap()
            .is_none());

        let subtree = repo.load_subtree(&mut conn, &MemberId::new("a")).await.unwrap();
        let mut ids: Vec<_> = subtree.into_iter().map(|n| n.member_id).collect();
        ids.sort();
        assert_eq!(ids, vec![MemberId::new("a"), MemberId::new("b")]);
    }

    #[tokio::test]
    async fn test_decrement_is_guarded_and_symmetric() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;
        let id = MemberId::new("root");
        let mut conn = repo.pool().acquire().await.unwrap();

        repo.increment_pv(&mut conn, &id, Side::Left, Pv(100), TimeMs::new(2)).await.unwrap();
        repo.increment_pv(&mut conn, &id, Side::Right, Pv(60), TimeMs::new(2)).await.unwrap();

        assert!(!repo.decrement_pv(&mut conn, &id, Pv(61), TimeMs::new(3)).await.unwrap());
        assert!(repo.decrement_pv(&mut conn, &id, Pv(60), TimeMs::new(3)).await.unwrap());

        let node = repo.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.left_pv, Pv(40));
        assert_eq!(node.right_pv, Pv::ZERO);
    }

    #[tokio::test]
    async fn test_increment_refuses_to_leave_integer_range() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;
        let id = MemberId::new("root");
        let mut conn = repo.pool().acquire().await.unwrap();

        let now = TimeMs::new(2);
        assert!(repo.increment_pv(&mut conn, &id, Side::Left, Pv::MAX, now).await.unwrap());
        assert!(!repo.increment_pv(&mut conn, &id, Side::Left, Pv(1), now).await.unwrap());
        assert!(repo.increment_pv(&mut conn, &id, Side::Right, Pv(1), now).await.unwrap());

        let err = repo
            .increment_pv(&mut conn, &id, Side::Right, Pv(u64::MAX), TimeMs::new(4))
            .await
            .unwrap_err();
        assert!(matches!(err, sqlx::Error::Encode(_)));

        // Still an INTEGER column that decodes.
        let node = repo.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.left_pv, Pv::MAX);
        assert_eq!(node.right_pv, Pv(1));
    }

    #[tokio::test]
    async fn test_consumed_event_is_recorded_once() {
        let (repo, _temp) = setup_test_db().await;
        seed(&repo).await;
        let event = PvEvent::new(MemberId::new("b"), Pv(5), TimeMs::new(10));
        let mut conn = repo.pool().acquire().await.unwrap();

        assert!(repo.record_consumed_event(&mut conn, &event, 2, TimeMs::new(11)).await.unwrap());
        assert!(!repo.record_consumed_event(&mut conn, &event, 2, TimeMs::new(12)).await.unwrap());
        assert!(repo.is_event_consumed(&event.event_key).await.unwrap());
    }
}
