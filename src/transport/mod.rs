//! HTTP transport for remote backends.

mod http;

pub use http::HttpTransport;
