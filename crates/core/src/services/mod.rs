//! Pipeline services.
//!
//! The four pure components ([`trace`], [`capability`], [`logs`],
//! [`balances`]) know nothing about the node or the store; the
//! [`ImportCoordinator`] wires them to the ports.

pub mod balances;
pub mod capability;
mod coordinator;
pub mod logs;
pub mod trace;

pub use balances::{BlockBalances, BlockInput, RewardSchedule};
pub use capability::CapabilityDetector;
pub use coordinator::{ImportCoordinator, ImportOutcome, IndexerConfig};
