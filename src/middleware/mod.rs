//! Middleware module for the Postpilot HTTP server
//!
//! Provides the shared-token authentication extractor.

pub mod auth;
