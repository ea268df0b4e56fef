pub mod compactor;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod schedule;
pub mod server;
pub mod store;
pub mod wal;
