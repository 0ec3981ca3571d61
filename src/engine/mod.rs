//! Pure computation for the binary tree: placement, propagation planning and matching.
//!
//! Nothing here touches storage; the orchestration layer loads state, calls into
//! these functions and persists the result.

pub mod matching;
pub mod placement;
pub mod propagation;
pub mod tree;

pub use matching::{settle, ConfigurationError, CounterUpdate, Settlement};
pub use placement::{PlacementError, PlacementPolicy, PlacementResolver, PlacementSlot};
pub use propagation::{plan_increments, AncestorStep, PvIncrement};
pub use tree::{TreeArena, TreeError};
