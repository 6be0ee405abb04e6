//! # icyserver - Logging et endpoint de métriques
//!
//! - [`logs::init_logging`] installe le subscriber `tracing` (stderr, `RUST_LOG`)
//! - [`MetricsServer`] expose les compteurs de bande passante via axum

pub mod logs;
pub mod server;

pub use logs::{init_logging, LoggingOptions};
pub use server::{router, MetricsServer};
