pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod payout;
pub mod server;
pub mod settlement;
