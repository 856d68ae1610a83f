pub mod api;
pub mod app;
pub mod broker;
pub mod buffer;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flusher;
pub mod models;
pub mod notification;
pub mod queue;
pub mod router;
pub mod utils;
pub mod workers;
