//! Client-facing API surface.

pub mod client_http;
