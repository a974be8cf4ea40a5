pub mod cli;
pub mod commands;
pub mod complete;
pub mod config;
pub mod error;
pub mod group;
pub mod job;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod site;
pub mod store;
pub mod transfer;
pub mod util;

pub use error::QueueError;
