use crate::http::headers::{ parse_header_block, Headers };

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            other => Err(ParseError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unsupported method {0:?}")]
    UnsupportedMethod(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("invalid chunked body")]
    InvalidChunk,
}

/// A parsed request. Only the router touches it afterwards, and only `uri`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// Parses one complete message. Use [`Request::message_len`] to know
    /// when enough bytes have been buffered.
    pub fn parse(raw_data: &[u8]) -> Result<Self, ParseError> {
        let header_end = Self::find_header_end(raw_data).ok_or(ParseError::Incomplete)?;
        let head = std::str::from_utf8(&raw_data[..header_end - 4])
            .map_err(|_| ParseError::MalformedRequest("head is not valid UTF-8".into()))?;

        let (request_line, header_block) = head.split_once("\r\n").unwrap_or((head, ""));
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let &[method, uri, version] = parts.as_slice() else {
            return Err(ParseError::MalformedRequest(format!("request line {:?}", request_line)));
        };
        let method: Method = method.parse()?;

        let headers = parse_header_block(header_block)
            .map_err(|line| ParseError::MalformedRequest(format!("header line {:?}", line)))?;

        let body = match Self::body_framing(&headers)? {
            BodyFraming::Chunked => {
                let (body, _) = decode_chunked(&raw_data[header_end..])?.ok_or(ParseError::Incomplete)?;
                body
            }
            BodyFraming::Length(len) => {
                let available = &raw_data[header_end..];
                if available.len() < len {
                    return Err(ParseError::Incomplete);
                }
                available[..len].to_vec()
            }
        };

        Ok(Request {
            method,
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body,
        })
    }

    /// Total length of the first message in `buf` once it has fully arrived.
    /// `Ok(None)` means more bytes are needed.
    pub fn message_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
        let Some((header_end, framing)) = Self::head_framing(buf)? else {
            return Ok(None);
        };
        match framing {
            BodyFraming::Length(len) => {
                let total = declared_total(header_end, len)?;
                Ok((buf.len() >= total).then_some(total))
            }
            BodyFraming::Chunked => {
                Ok(decode_chunked(&buf[header_end..])?.map(|(_, used)| header_end + used))
            }
        }
    }

    /// Size the first message will have, known as soon as its head arrives
    /// with a `Content-Length`. Chunked bodies have no declared size.
    pub fn declared_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
        match Self::head_framing(buf)? {
            Some((header_end, BodyFraming::Length(len))) => declared_total(header_end, len).map(Some),
            _ => Ok(None),
        }
    }

    fn head_framing(buf: &[u8]) -> Result<Option<(usize, BodyFraming)>, ParseError> {
        let Some(header_end) = Self::find_header_end(buf) else {
            return Ok(None);
        };
        let head = String::from_utf8_lossy(&buf[..header_end - 4]);
        let header_block = head.split_once("\r\n").map(|(_, rest)| rest).unwrap_or("");
        // Framing only needs the two framing headers; a malformed line is
        // reported by `parse` once the message is complete.
        let headers: Headers = header_block
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k, v.trim()))
            .collect();

        Ok(Some((header_end, Self::body_framing(&headers)?)))
    }

    fn body_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
        if let Some(te) = headers.get("transfer-encoding") {
            if te.to_ascii_lowercase().split(',').any(|t| t.trim() == "chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }
        match headers.get("content-length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map(BodyFraming::Length)
                .map_err(|_| ParseError::InvalidContentLength(value.to_string())),
            None => Ok(BodyFraming::Length(0)),
        }
    }

    /// Offset just past the `\r\n\r\n` that ends the head.
    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|pos| pos + 4)
    }

    pub fn path(&self) -> &str {
        self.uri.split_once('?').map(|(p, _)| p).unwrap_or(&self.uri)
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// First value of a query parameter, `+` and `%XX` decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query()?.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

enum BodyFraming {
    Length(usize),
    Chunked,
}

fn declared_total(header_end: usize, len: usize) -> Result<usize, ParseError> {
    header_end
        .checked_add(len)
        .ok_or_else(|| ParseError::InvalidContentLength(len.to_string()))
}

/// Walks a chunked body. Returns the decoded bytes and how many input bytes
/// the encoding used, or `None` if the terminating chunk has not arrived.
pub fn decode_chunked(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = find_crlf(&data[pos..]) else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&data[pos..pos + line_len]).map_err(|_| ParseError::InvalidChunk)?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section: header lines until an empty one.
            loop {
                let Some(len) = find_crlf(&data[pos..]) else {
                    return Ok(None);
                };
                pos += len + 2;
                if len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        let chunk_end = pos.checked_add(size).and_then(|end| end.checked_add(2)).ok_or(ParseError::InvalidChunk)?;
        if data.len() < chunk_end {
            return Ok(None);
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size;
        if &data[pos..pos + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }
        pos += 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
