pub mod memory;
pub mod models;
pub mod reconcile;
pub mod repository;
pub mod store;

pub use memory::{FaultPoint, InMemoryLedgerStore};
pub use repository::LedgerRepository;
pub use store::{BankDirectory, LedgerStore};
