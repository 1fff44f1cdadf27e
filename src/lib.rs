pub mod api;
pub mod batch;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod models;
pub mod reconciler;
pub mod render;
pub mod signature;
pub mod store;
pub mod suppression;
pub mod templates;
pub mod utils;
pub mod worker;
