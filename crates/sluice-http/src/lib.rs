//! HTTP/1.x application layer for the sluice engine: incremental request
//! parsing, per-connection sessions, the parser and handler stages, the
//! response builder, YAML configuration, and the static-file handler.

pub mod config;
pub mod handler;
pub mod method;
pub mod parser;
pub mod request;
pub mod response;
pub mod session;
pub mod stages;
pub mod static_files;
pub mod status;

pub use config::{ConfigError, ServerConfig, UrlRule, VHostConfig};
pub use handler::{HandlerOptions, HandlerRegistry, HttpHandler, HttpHandlerFactory};
pub use method::Method;
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use session::{HttpProtocol, HttpRequestData, HttpSession, MAX_BODY_SIZE};
pub use stages::{HttpHandlerStage, HttpParserStage};
pub use static_files::StaticFileHandlerFactory;
pub use status::HttpStatus;

/// Engine types specialized to the HTTP protocol.
pub type HttpConnection = sluice::Connection<HttpProtocol>;
pub type HttpPipeline = sluice::Pipeline<HttpProtocol>;
