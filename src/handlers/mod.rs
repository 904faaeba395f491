//! HTTP handlers.
//!
//! Handlers translate between HTTP and [`crate::service::IngestionService`];
//! authentication and rate limiting happen earlier, in the middleware
//! stack built by [`crate::server::app`].

pub mod files;
pub mod health;
