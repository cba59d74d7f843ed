pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod import;
pub mod limits;
pub mod model;
pub mod notification;
pub mod notify;
pub mod observability;
pub mod transition;
pub mod wal;
pub mod wire;
