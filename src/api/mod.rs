//! HTTP API Module
//!
//! Provides a REST API for minting, replication and node status.

mod http;

pub use http::HttpServer;
