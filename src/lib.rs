pub mod aggregate;
pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
