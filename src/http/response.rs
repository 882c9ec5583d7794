use crate::http::headers::{ canonical_name, Headers };
use crate::http::request::HTTP_VERSION;

use std::fmt;

pub const SERVER_NAME: &str = "webserv/0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const CONTENT_TOO_LARGE: StatusCode = StatusCode(413);
    pub const IM_A_TEAPOT: StatusCode = StatusCode(418);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }

    /// 1xx, 204 and 304 never carry a body.
    pub fn allows_body(&self) -> bool {
        !(self.0 < 200 || self.0 == 204 || self.0 == 304)
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Content Too Large",
            414 => "URI Too Long",
            418 => "I'm a teapot",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: HTTP_VERSION.to_string(),
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(status);
        response.set_body(content_type, body);
        response
    }

    pub fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::with_body(status, "text/html; charset=utf-8", body)
    }

    pub fn redirect(status: StatusCode, location: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert("location", location);
        response
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Vec<u8>>) {
        self.headers.insert("content-type", content_type);
        self.body = body.into();
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Stamps the headers every response carries. Call once, just before
    /// [`Response::serialize`].
    pub fn finalize(&mut self) {
        self.headers.insert("server", SERVER_NAME);
        self.headers.insert("connection", "close");
        if self.status.allows_body() {
            self.headers.insert("content-length", self.body.len().to_string());
        } else {
            self.headers.remove("content-length");
            self.body.clear();
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.version, self.status.0, self.status.reason());
        for (key, value) in self.headers.iter() {
            head.push_str(&canonical_name(key));
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Built-in page used when no error page is configured or readable.
pub fn fallback_page(status: StatusCode) -> String {
    format!(
        "<html><head><title>{code} {reason}</title></head>\
        <body style='font-family:sans-serif; text-align:center; padding-top:50px;'>\
        <h1>{code} {reason}</h1><hr><p>{server}</p></body></html>",
        code = status.0,
        reason = status.reason(),
        server = SERVER_NAME
    )
}
