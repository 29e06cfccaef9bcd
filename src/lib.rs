pub mod auth;
pub mod config;
pub mod engine;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod reaper;
pub mod sealed;
pub mod signature;
pub mod wal;
