pub mod config;
pub mod engine;
pub mod handle;
pub mod humanize;
pub mod multi;
pub mod observability;
pub mod reconcile;
pub mod worker;
