//! Domain types for the binary-tree PV settlement engine.
//!
//! This module provides:
//! - Lossless monetary handling via the Decimal wrapper
//! - Primitives: TimeMs, MemberId, Rank, CycleId, Side, Pv
//! - Members, tree nodes, PV events, settlement records and cycle reports
//! - Wallet and ledger transaction types
//! - Cycle boundary arithmetic

pub mod cycle;
pub mod decimal;
pub mod member;
pub mod primitives;
pub mod pv_event;
pub mod settlement;
pub mod wallet;

pub use cycle::{CycleBoundary, CycleBoundaryParseError};
pub use decimal::Decimal;
pub use member::{LegSnapshot, Member, NewMember, TreeNode};
pub use primitives::{CycleId, MemberId, Pv, Rank, Side, SideParseError, TimeMs};
pub use pv_event::PvEvent;
pub use settlement::{
    CapApplied, CycleReport, CycleStatus, FailureKind, MemberFailure, SettlementRecord,
};
pub use wallet::{LedgerReason, LedgerTransaction, TransactionKind, WalletBalance};
