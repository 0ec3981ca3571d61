pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod orchestration;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    CycleId, CycleReport, CycleStatus, Decimal, Member, MemberId, NewMember, Pv, PvEvent, Rank,
    SettlementRecord, Side, TimeMs, TreeNode,
};
pub use error::AppError;
pub use ledger::{Ledger, LedgerError, SqliteLedger};
pub use orchestration::{MemberLocks, Placer, Propagator, SettlementOrchestrator};
