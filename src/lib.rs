pub mod api;
pub mod concurrent_fetcher;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod secrets;
