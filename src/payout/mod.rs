pub mod gateway;
pub mod scheduler;

pub use gateway::{DisbursementGateway, DisbursementRequest, PayMongoGateway, ScriptedGateway};
pub use scheduler::{PayoutOutcome, PayoutRunReport, PayoutScheduler};
