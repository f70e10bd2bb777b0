pub mod app_context;
pub mod config;
pub mod core;
pub mod data_connector;
pub mod middleware;
pub mod observability;
pub mod policies;
pub mod routers;
pub mod server;
