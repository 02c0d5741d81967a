// Settlement of expired raffles
pub mod reconciler;
pub mod scheduler;
pub mod winners;

pub use reconciler::{SettlementConfig, SettlementOutcome, SettlementReconciler};
pub use scheduler::SettlementScheduler;
