// Public API for integration tests and potential library usage

pub mod api;
pub mod config;
pub mod coordinator;
pub mod identity;
pub mod protocol;
pub mod state;
pub mod stats;
pub mod types;
pub mod ws;
