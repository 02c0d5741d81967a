// Raffle persistence: domain models, the store seam and its backends
pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryRaffleStore;
pub use repository::{PgRaffleStore, RaffleStore};
