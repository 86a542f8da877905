//! Transport adapters
//!
//! Transports own wire concerns only: header and query parsing, origin
//! checks, CORS, and SSE framing. Protocol semantics live in
//! [`ProtocolEngine`](crate::dispatch::ProtocolEngine), which every adapter
//! shares.

pub mod http;

pub use http::HttpTransport;
