use crate::http::response::{ Response, StatusCode };
use crate::router::Outcome;

use percent_encoding::{ utf8_percent_encode, AsciiSet, CONTROLS };
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{ debug, warn };

/// Characters escaped in a single path segment of a listing link.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Content type of the static assets served ahead of location checks.
pub fn asset_content_type(path: &str) -> Option<&'static str> {
    if path.ends_with(".css") {
        Some("text/css")
    } else if path.ends_with(".js") {
        Some("text/javascript")
    } else if path.ends_with(".pdf") {
        Some("application/pdf")
    } else {
        None
    }
}

pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

pub fn serve_asset(path: &Path, content_type: &str) -> Outcome {
    let body = read(path)?;
    Ok(Response::with_body(StatusCode::OK, content_type, body))
}

pub fn serve_file(path: &Path) -> Outcome {
    if !path.is_file() {
        debug!(path = %path.display(), "not a regular file");
        return Err(StatusCode::NOT_FOUND);
    }
    let body = read(path)?;
    Ok(Response::with_body(StatusCode::OK, &content_type_for(path), body))
}

fn read(path: &Path) -> Result<Vec<u8>, StatusCode> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        // Reading a directory lands here on Linux.
        ErrorKind::IsADirectory => StatusCode::NOT_FOUND,
        _ => {
            warn!(path = %path.display(), error = %e, "failed to read file");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })
}

/// HTML index of `dir`: directories first, then files, each sorted by name.
/// `uri_path` ends with `/`.
pub fn directory_listing(uri_path: &str, dir: &Path, root: &Path) -> Outcome {
    let entries = fs::read_dir(dir).map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "cannot list directory");
        StatusCode::FORBIDDEN
    })?;

    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => directories.push(name),
            Ok(_) => files.push(name),
            Err(_) => continue,
        }
    }
    directories.sort();
    files.sort();

    let title = escape_html(uri_path);
    let mut body = format!(
        "<!doctype html><html><head><title>Index of {title}</title></head>\
        <body><h1>Index of {title}</h1><hr><pre>\n"
    );
    if dir != root && uri_path != "/" {
        body.push_str("<a href=\"../\">../</a>\n");
    }
    for name in &directories {
        let href = utf8_percent_encode(name, SEGMENT);
        body.push_str(&format!("<a href=\"{}/\">{}/</a>\n", href, escape_html(name)));
    }
    for name in &files {
        let href = utf8_percent_encode(name, SEGMENT);
        body.push_str(&format!("<a href=\"{}\">{}</a>\n", href, escape_html(name)));
    }
    body.push_str("</pre><hr></body></html>");

    Ok(Response::html(StatusCode::OK, body))
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
