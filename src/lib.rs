//! A single-threaded, non-blocking HTTP/1.1 origin server with virtual
//! hosts, location routing, uploads and CGI.

pub mod config;
pub mod handlers;
pub mod http;
pub mod network;
pub mod router;
pub mod server;

pub use config::{ parse_config, GlobalConfig };
pub use server::{ Server, ServerError };
