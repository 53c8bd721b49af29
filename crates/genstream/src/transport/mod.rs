//! Transport layer for genstream.
//!
//! Provides the HTTP transport (axum): generation submission, provider
//! webhooks, status polling and server-sent event streams.

pub mod http;

pub use http::{ServerConfig, serve};
