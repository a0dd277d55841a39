//! library

pub mod admin;
pub mod cache;
pub mod config;
pub mod director;
pub mod forwarder;
pub mod httpserv;
pub mod region;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod upstream;
pub mod utils;
pub use utils::metrics;
