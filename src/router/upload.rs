use crate::http::multipart;
use crate::http::request::Request;
use crate::http::response::{ Response, StatusCode };
use crate::router::static_files::escape_html;
use crate::router::Outcome;

use std::fs;
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };
use tracing::{ debug, error, info };

const RETURN_HOME: &str = "<br><br><a href='/'>Return Home</a>";

pub fn post(request: &Request, upload_dir: &Path) -> Outcome {
    if request.body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let content_type = request.content_type().unwrap_or("");
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

    match mime.as_str() {
        "multipart/form-data" => {
            let boundary = multipart::boundary(content_type).ok_or(StatusCode::BAD_REQUEST)?;
            let mut stored = 0;
            for part in multipart::parse(&request.body, boundary) {
                let Some(name) = part.file_name.as_deref().and_then(sanitize_file_name) else {
                    continue;
                };
                store(upload_dir, &name, &part.data)?;
                stored += 1;
            }
            if stored == 0 {
                debug!("multipart body carried no files");
                return Err(StatusCode::BAD_REQUEST);
            }
            Ok(Response::html(StatusCode::OK, uploads_page(upload_dir)))
        }
        "application/x-www-form-urlencoded" => Ok(Response::html(StatusCode::OK, echo_page(&request.body))),
        "text/plain" => {
            let name = request
                .query_param("filename")
                .and_then(|n| sanitize_file_name(&n))
                .unwrap_or_else(|| "upload.txt".to_string());
            store(upload_dir, &name, &request.body)?;
            Ok(Response::with_body(StatusCode::CREATED, "text/plain; charset=utf-8", "File created successfully"))
        }
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// Removes `?filename=` from the upload directory. A file that is already
/// gone is not an error; either way the refreshed listing is returned.
pub fn delete(request: &Request, upload_dir: &Path) -> Outcome {
    let name = request
        .query_param("filename")
        .and_then(|n| sanitize_file_name(&n))
        .ok_or(StatusCode::BAD_REQUEST)?;

    match fs::remove_file(upload_dir.join(&name)) {
        Ok(()) => info!(file = %name, "upload deleted"),
        Err(e) if e.kind() == ErrorKind::NotFound => debug!(file = %name, "delete of missing upload"),
        Err(e) => {
            error!(file = %name, error = %e, "failed to delete upload");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(Response::html(StatusCode::OK, uploads_page(upload_dir)))
}

fn store(upload_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, StatusCode> {
    let io_failure = |e: std::io::Error| {
        error!(dir = %upload_dir.display(), error = %e, "upload failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    fs::create_dir_all(upload_dir).map_err(io_failure)?;

    let dest = unique_path(upload_dir, name);
    fs::write(&dest, data).map_err(io_failure)?;
    info!(path = %dest.display(), bytes = data.len(), "upload stored");
    Ok(dest)
}

/// `name.ext`, then `name_2.ext`, `name_3.ext`, ... until the path is free.
/// The extension starts at the first dot after the first character.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let dot = name.char_indices().skip(1).find(|&(_, c)| c == '.').map(|(i, _)| i);
    let (stem, ext) = match dot {
        Some(pos) => name.split_at(pos),
        None => (name, ""),
    };
    (2u32..)
        .map(|n| dir.join(format!("{}_{}{}", stem, n, ext)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Reduces a client supplied name to a bare file name.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name.trim().rsplit(['/', '\\']).next()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

pub fn uploads_page(upload_dir: &Path) -> String {
    let mut names: Vec<String> = fs::read_dir(upload_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| !name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();

    let mut items = String::new();
    for name in &names {
        let name = escape_html(name);
        items.push_str(&format!(
            "<li style=\"clear: both;\"><div style=\"display: inline;\">{name}</div>\
            <button style=\"float: right;\" data-file=\"{name}\" onclick=\"deleteUpload(this)\">Delete</button></li>"
        ));
    }

    format!(
        "<html><head><script>\
        function deleteUpload(button) {{\
            var url = window.location.pathname + '?filename=' + encodeURIComponent(button.dataset.file);\
            fetch(url, {{ method: 'DELETE' }}).then(function () {{ window.location.reload(); }});\
        }}\
        </script></head><body><h2>Uploads:</h2><ul>{items}</ul><a href='/'>Return Home</a></body></html>"
    )
}

fn echo_page(body: &[u8]) -> String {
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
    if fields.iter().all(|(_, value)| value.is_empty()) {
        return format!("<html><body>This field cannot be empty{}</body></html>", RETURN_HOME);
    }

    let mut out = String::from("<html><body>");
    for (key, value) in &fields {
        out.push_str(&format!("You've entered: {} = {}<br>", escape_html(key), escape_html(value)));
    }
    out.push_str(RETURN_HOME);
    out.push_str("</body></html>");
    out
}
