pub mod api;
pub mod app;
pub mod briefing;
pub mod config;
pub mod global;
pub mod providers;
pub mod session;
pub mod speech;
pub mod store;
pub mod transcript;
