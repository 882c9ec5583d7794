pub mod headers;
pub mod multipart;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{ Method, ParseError, Request, HTTP_VERSION };
pub use response::{ fallback_page, Response, StatusCode };
