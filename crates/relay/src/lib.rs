pub mod api;
pub mod bus;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod ws;
