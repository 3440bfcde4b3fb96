//! Monitored key records and the import/delete service around them.

pub mod models;
pub mod service;

pub use models::{mask_secret, KeyInfo, KeyRecord};
pub use service::{ImportOutcome, KeyService};
