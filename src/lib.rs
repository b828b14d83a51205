//! HTTP/1.1 served straight off tokio TCP streams.
//!
//! Each accepted connection carries exactly one request: it is parsed
//! incrementally with [`Request::from_reader`], handed to a [`Handler`]
//! together with a [`ResponseWriter`], and the connection is closed once the
//! handler returns.

pub mod config;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;

pub use async_trait::async_trait;

pub use crate::config::ServerConfig;
pub use crate::headers::{HeaderError, HeaderName, HeaderTable};
pub use crate::request::{ParseError, ParserState, Request, RequestLine};
pub use crate::response::{default_headers, ResponseWriter, StatusCode, WriteError, WriterState};
pub use crate::server::{Handler, Server, ServerError};
