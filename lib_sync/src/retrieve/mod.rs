//! # Data Retrieval Module
//!
//! HTTP clients used to build resource fetchers.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff, and [`ky_http::http_fetcher`], which turns a path into a
//!   conditional-request-aware resource fetcher.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

pub use ky_http::{http_fetcher, ApiClient, ApiResponse};
