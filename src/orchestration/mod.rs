//! IO-driving layer: loads tree state, calls the pure engine, persists the result.

pub mod locks;
pub mod placement;
pub mod propagation;
pub mod scheduler;
pub mod settlement;

pub use locks::{MemberGuard, MemberLocks};
pub use placement::Placer;
pub use propagation::{
    EventFailure, PropagationError, PropagationOutcome, PropagationReport, Propagator,
};
pub use scheduler::CycleScheduler;
pub use settlement::{CycleError, SettleOutcome, SettlementError, SettlementOrchestrator};
