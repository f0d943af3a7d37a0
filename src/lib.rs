pub mod api;
pub mod app;
pub mod bus;
pub mod client;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod hub;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod offline_queue;
pub mod presence;
pub mod processor;
pub mod protocol;
pub mod status_cache;
pub mod store;
