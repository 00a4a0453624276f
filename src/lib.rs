pub mod catalog;
pub mod config;
pub mod dag;
pub mod errors;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod retry;
pub mod ui;
