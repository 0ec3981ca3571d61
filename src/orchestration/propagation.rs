//! PV propagation against the persisted tree.

use crate::db::Repository;
use crate::domain::{MemberId, Pv, PvEvent, TimeMs};
use crate::engine::plan_increments;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("member {0} has no tree placement")]
    MemberNotFound(MemberId),
    #[error("PV event {0} has a zero amount")]
    ZeroAmount(String),
    #[error("PV event {event_key} amount {amount} exceeds the storable maximum")]
    AmountTooLarge { event_key: String, amount: Pv },
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationOutcome {
    pub event_key: String,
    pub ancestors_credited: usize,
    /// The key was consumed before; nothing changed.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFailure {
    pub event_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationReport {
    pub applied: Vec<PropagationOutcome>,
    pub duplicates: Vec<String>,
    pub failures: Vec<EventFailure>,
}

#[derive(Debug, Clone)]
pub struct Propagator {
    repo: Arc<Repository>,
    max_depth: Option<u32>,
}

impl Propagator {
    pub fn new(repo: Arc<Repository>, max_depth: Option<u32>) -> Self {
        Self { repo, max_depth }
    }

    /// Push `event.amount` up the source's ancestor path.
    ///
    /// The path increments and the event archive row commit in one transaction; a key
    /// that was already consumed is reported as a duplicate and changes nothing.
    pub async fn propagate(&self, event: &PvEvent) -> Result<PropagationOutcome, PropagationError> {
        if event.amount.is_zero() {
            return Err(PropagationError::ZeroAmount(event.event_key.clone()));
        }
        if !event.amount.fits_storage() {
            return Err(PropagationError::AmountTooLarge {
                event_key: event.event_key.clone(),
                amount: event.amount,
            });
        }

        let now = TimeMs::now();
        let mut tx = self.repo.begin().await?;
        if !self.repo.touch_node(&mut tx, &event.source, now).await? {
            return Err(PropagationError::MemberNotFound(event.source.clone()));
        }

        let population = self.repo.count_nodes(&mut tx).await?;
        let limit = match self.max_depth {
            Some(depth) => u64::from(depth).min(population),
            None => population,
        };
        let path = self
            .repo
            .ancestor_path(&mut tx, &event.source, limit)
            .await?
            .ok_or_else(|| PropagationError::MemberNotFound(event.source.clone()))?;

        let truncated_by_depth = limit < population && path.steps.len() as u64 == limit;
        if !path.reached_root && !truncated_by_depth {
            let reason = format!(
                "ancestor walk from {} did not reach the root within {} hops",
                event.source,
                path.steps.len()
            );
            error!(member_id = %event.source, event_key = %event.event_key, "{}", reason);
            return Err(PropagationError::ConsistencyViolation(reason));
        }

        let increments = plan_increments(&path.steps, event.amount, self.max_depth);

        if !self
            .repo
            .record_consumed_event(&mut tx, event, increments.len(), now)
            .await?
        {
            debug!(event_key = %event.event_key, "duplicate PV event ignored");
            return Ok(PropagationOutcome {
                event_key: event.event_key.clone(),
                ancestors_credited: 0,
                duplicate: true,
            });
        }

        for inc in &increments {
            if !self
                .repo
                .increment_pv(&mut tx, &inc.member_id, inc.side, inc.amount, now)
                .await?
            {
                // Dropping `tx` undoes the increments already applied on this path.
                let reason = format!(
                    "{} leg of ancestor {} rejected +{} from {} (missing node or PV overflow)",
                    inc.side, inc.member_id, inc.amount, event.source
                );
                error!(member_id = %event.source, event_key = %event.event_key, "{}", reason);
                return Err(PropagationError::ConsistencyViolation(reason));
            }
        }
        tx.commit().await?;

        debug!(
            event_key = %event.event_key,
            source = %event.source,
            amount = %event.amount,
            ancestors = increments.len(),
            "PV propagated"
        );
        Ok(PropagationOutcome {
            event_key: event.event_key.clone(),
            ancestors_credited: increments.len(),
            duplicate: false,
        })
    }

    /// Propagate each event independently. A failing event never stops the others.
    pub async fn propagate_batch(&self, events: &[PvEvent]) -> PropagationReport {
        let mut report = PropagationReport::default();
        for event in events {
            match self.propagate(event).await {
                Ok(outcome) if outcome.duplicate => report.duplicates.push(outcome.event_key),
                Ok(outcome) => report.applied.push(outcome),
                Err(e) => {
                    warn!(event_key = %event.event_key, error = %e, "PV event failed");
                    report.failures.push(EventFailure {
                        event_key: event.event_key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
