//! Matching & capping: converts one member's matched PV into a capped payout.
//!
//! Pure: reads the member's counters and the configuration, touches nothing else.
//! The caller applies the returned counter update and credits the ledger.

use crate::config::SettlementConfig;
use crate::domain::{
    CapApplied, CycleId, Decimal, Member, Pv, Rank, SettlementRecord, TimeMs, TreeNode,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("pv_to_currency_rate must be positive, got {0}")]
    NonPositiveRate(Decimal),
    #[error("no daily cap configured for rank '{0}'")]
    MissingRankCap(Rank),
}

/// Counter values to persist alongside the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Symmetric decrement for both legs.
    pub flush: Pv,
    pub daily_matched_pv: Pv,
    pub lifetime_matched_pv: Pv,
    pub lifetime_income: Decimal,
    pub cycle: CycleId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub record: SettlementRecord,
    pub counters: CounterUpdate,
}

impl Settlement {
    /// Whether a ledger credit is owed.
    pub fn pays(&self) -> bool {
        self.record.paid_amount.is_positive()
    }
}

/// Settle `member` for `cycle` from the counters in `node`.
///
/// Only monetized PV is flushed: when a cap binds, the unpaid part of the matched PV
/// stays in both legs for later cycles. PV is whole, so the payout is always
/// `flushed × rate` and never exceeds the binding cap.
pub fn settle(
    node: &TreeNode,
    member: &Member,
    cycle: &CycleId,
    config: &SettlementConfig,
    now: TimeMs,
) -> Result<Settlement, ConfigurationError> {
    let matched = node.matchable_pv();
    let used_this_cycle = node.matched_in_cycle(cycle);

    if matched.is_zero() {
        return Ok(build(
            node,
            member,
            cycle,
            now,
            matched,
            Pv::ZERO,
            Decimal::zero(),
            CapApplied::None,
            used_this_cycle,
        ));
    }

    let rate = config.pv_to_currency_rate;
    if !rate.is_positive() {
        return Err(ConfigurationError::NonPositiveRate(rate));
    }
    let daily_cap = config
        .daily_cap_for(&member.rank)
        .ok_or_else(|| ConfigurationError::MissingRankCap(member.rank.clone()))?;

    let mut flushed = matched;
    let mut cap_applied = CapApplied::None;

    let cycle_budget = (daily_cap - Decimal::from_pv(used_this_cycle, rate)).max(Decimal::zero());
    let cycle_pv = cycle_budget.whole_pv_at(rate);
    if cycle_pv < flushed {
        flushed = cycle_pv;
        cap_applied = CapApplied::Cycle;
    }

    if let Some(multiplier) = config.lifetime_cap_multiplier {
        let lifetime_cap = multiplier * member.package_amount;
        let lifetime_budget = (lifetime_cap - node.lifetime_income).max(Decimal::zero());
        let lifetime_pv = lifetime_budget.whole_pv_at(rate);
        if lifetime_pv < flushed {
            flushed = lifetime_pv;
            cap_applied = CapApplied::Lifetime;
        }
    }

    let paid = Decimal::from_pv(flushed, rate);
    Ok(build(node, member, cycle, now, matched, flushed, paid, cap_applied, used_this_cycle))
}

#[allow(clippy::too_many_arguments)]
fn build(
    node: &TreeNode,
    member: &Member,
    cycle: &CycleId,
    now: TimeMs,
    matched: Pv,
    flushed: Pv,
    paid: Decimal,
    cap_applied: CapApplied,
    used_this_cycle: Pv,
) -> Settlement {
    Settlement {
        record: SettlementRecord {
            member_id: member.id.clone(),
            cycle_id: cycle.clone(),
            matched_pv: matched,
            paid_amount: paid,
            flushed_pv: flushed,
            cap_applied,
            transaction_id: None,
            settled_at: now,
        },
        counters: CounterUpdate {
            flush: flushed,
            daily_matched_pv: used_this_cycle.saturating_add(flushed),
            lifetime_matched_pv: node.lifetime_matched_pv.saturating_add(flushed),
            lifetime_income: node.lifetime_income + paid,
            cycle: cycle.clone(),
        },
    }
}
