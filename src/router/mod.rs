//! Turns a parsed request and the configuration tree into a response.
//!
//! Order of decisions: protocol version, virtual host, server redirect,
//! location (longest prefix), static asset fast path, location redirect,
//! method, body size, then directory / CGI / method dispatch. Error statuses
//! run through the location -> server -> global error-page cascade.

pub mod static_files;
pub mod upload;

use crate::config::models::{ GlobalConfig, LocationConfig, Redirect, ServerConfig };
use crate::handlers::cgi::{ CgiContext, CgiHandler };
use crate::http::request::{ Method, Request, HTTP_VERSION };
use crate::http::response::{ fallback_page, Response, StatusCode };

use percent_encoding::percent_decode_str;
use std::path::{ Path, PathBuf };
use tracing::{ debug, error, warn };

/// A handler either produces a response or names the error status to render.
pub type Outcome = Result<Response, StatusCode>;

pub struct Router<'a> {
    config: &'a GlobalConfig,
    cgi: &'a dyn CgiHandler,
}

/// The server and location a request resolved to.
#[derive(Clone, Copy)]
pub struct Route<'a> {
    pub config: &'a GlobalConfig,
    pub server: &'a ServerConfig,
    pub prefix: Option<&'a str>,
    pub location: Option<&'a LocationConfig>,
}

impl<'a> Route<'a> {
    pub fn root(&self) -> &'a Path {
        self.location
            .and_then(|l| l.root.as_deref())
            .or(self.server.root.as_deref())
            .unwrap_or(self.config.root.as_path())
    }

    pub fn upload_dir(&self) -> &'a Path {
        self.location
            .and_then(|l| l.upload_dir.as_deref())
            .or(self.server.upload_dir.as_deref())
            .unwrap_or(self.config.upload_dir.as_path())
    }

    pub fn max_body_size(&self) -> usize {
        self.location
            .and_then(|l| l.max_body_size)
            .or(self.server.max_body_size)
            .unwrap_or(self.config.max_body_size)
    }

    /// Error page path for `status`, first hit in location, server, global.
    pub fn error_page(&self, status: StatusCode) -> Option<&'a str> {
        let code = status.as_u16();
        self.location
            .and_then(|l| l.error_pages.get(&code))
            .or_else(|| self.server.error_pages.get(&code))
            .or_else(|| self.config.error_pages.get(&code))
            .map(String::as_str)
    }

    /// Maps a decoded URI path onto the resolved root.
    pub fn fs_path(&self, path: &str) -> PathBuf {
        self.root().join(path.trim_start_matches('/'))
    }
}

impl<'a> Router<'a> {
    pub fn new(config: &'a GlobalConfig, cgi: &'a dyn CgiHandler) -> Self {
        Self { config, cgi }
    }

    /// Produces the finalized response for one request.
    pub fn handle_request(&self, request: Request) -> Response {
        let mut response = if request.version != HTTP_VERSION {
            // Other protocol versions are answered without routing.
            Response::new(StatusCode::IM_A_TEAPOT)
        } else {
            match self.select_server(request.header("host")) {
                Some(server) => self.route(request, server),
                None => {
                    debug!(host = ?request.header("host"), "no virtual host matched");
                    Response::html(StatusCode::NOT_FOUND, fallback_page(StatusCode::NOT_FOUND))
                }
            }
        };
        response.finalize();
        response
    }

    /// Response for a request that never made it to routing, e.g. one that
    /// failed to parse. Only the global error pages apply.
    pub fn reject(&self, status: StatusCode) -> Response {
        let mut response = match self.config.error_pages.get(&status.as_u16()) {
            Some(page) => read_error_page(&self.config.root, page, status),
            None => Response::html(status, fallback_page(status)),
        };
        response.finalize();
        response
    }

    /// First server whose listen pair, `localhost:port`, or a server name
    /// plus port equals the Host header.
    pub fn select_server(&self, host: Option<&str>) -> Option<&'a ServerConfig> {
        let host = host?.trim();
        self.config.servers.iter().find(|server| {
            let port = server.listen.port;
            host.eq_ignore_ascii_case(&format!("{}:{}", server.listen.address, port))
                || host.eq_ignore_ascii_case(&format!("localhost:{}", port))
                || server
                    .server_names
                    .iter()
                    .any(|name| host.eq_ignore_ascii_case(&format!("{}:{}", name, port)))
        })
    }

    fn route(&self, mut request: Request, server: &'a ServerConfig) -> Response {
        let mut route = Route {
            config: self.config,
            server,
            prefix: None,
            location: None,
        };

        if let Some(redirect) = &server.redirect {
            return redirect_response(redirect, &request.uri);
        }

        let path = percent_decode_str(request.path()).decode_utf8_lossy().into_owned();

        let Some((prefix, location)) = select_location(server, &path) else {
            return self.error_page(&route, StatusCode::NOT_FOUND);
        };
        route.prefix = Some(prefix);
        route.location = Some(location);

        if path.split('/').any(|segment| segment == "..") {
            warn!(uri = %request.uri, "path traversal rejected");
            return self.error_page(&route, StatusCode::FORBIDDEN);
        }

        let outcome = self.dispatch(&mut request, &route, location, &path);
        match outcome {
            Ok(response) => response,
            Err(status) => self.error_page(&route, status),
        }
    }

    fn dispatch(&self, request: &mut Request, route: &Route<'a>, location: &'a LocationConfig, path: &str) -> Outcome {
        if let Some(content_type) = static_files::asset_content_type(path) {
            return static_files::serve_asset(&route.fs_path(path), content_type);
        }

        if let Some(redirect) = &location.redirect {
            return Ok(redirect_response(redirect, &request.uri));
        }

        if !location.methods.contains(&request.method) {
            debug!(method = %request.method, prefix = ?route.prefix, "method not allowed");
            return Err(StatusCode::METHOD_NOT_ALLOWED);
        }

        if request.body.len() > route.max_body_size() {
            debug!(len = request.body.len(), max = route.max_body_size(), "body too large");
            return Err(StatusCode::CONTENT_TOO_LARGE);
        }

        let fs_path = route.fs_path(path);
        if request.method == Method::Get && fs_path.is_dir() {
            return self.directory(request, route, location, path, &fs_path);
        }

        if location.cgi {
            if let Some((script_name, path_info)) = cgi_split(location, path) {
                return self.run_cgi(request, route, location, script_name, path_info);
            }
        }

        match request.method {
            Method::Get => static_files::serve_file(&fs_path),
            Method::Post => upload::post(request, route.upload_dir()),
            Method::Delete => upload::delete(request, route.upload_dir()),
        }
    }

    fn directory(
        &self,
        request: &mut Request,
        route: &Route<'a>,
        location: &LocationConfig,
        path: &str,
        dir: &Path
    ) -> Outcome {
        let index = dir.join(&location.index);
        if index.is_file() {
            let separator = if path.ends_with('/') { "" } else { "/" };
            request.uri = format!("{}{}{}", path, separator, location.index);
            return static_files::serve_file(&index);
        }

        if location.autoindex {
            if !path.ends_with('/') {
                let target = match request.query() {
                    Some(query) => format!("{}/?{}", request.path(), query),
                    None => format!("{}/", request.path()),
                };
                return Ok(Response::redirect(StatusCode::MOVED_PERMANENTLY, target));
            }
            return static_files::directory_listing(path, dir, route.root());
        }

        Err(StatusCode::FORBIDDEN)
    }

    fn run_cgi(
        &self,
        request: &Request,
        route: &Route<'a>,
        location: &'a LocationConfig,
        script_name: &str,
        path_info: &str
    ) -> Outcome {
        let script = route.fs_path(script_name);
        if !script.is_file() {
            return Err(StatusCode::NOT_FOUND);
        }

        let ctx = CgiContext {
            request,
            location,
            server: route.server,
            config: route.config,
            root: route.root(),
            script: &script,
            script_name,
            path_info,
        };
        let mut response = Response::new(StatusCode::OK);
        match self.cgi.execute(&ctx, &mut response) {
            Ok(()) => Ok(response),
            Err(e) => {
                error!(script = %script.display(), error = %e, "CGI execution failed");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn error_page(&self, route: &Route<'a>, status: StatusCode) -> Response {
        match route.error_page(status) {
            Some(page) => read_error_page(route.root(), page, status),
            None => Response::html(status, fallback_page(status)),
        }
    }
}

/// Location whose prefix is the longest prefix of `path`.
pub fn select_location<'s>(server: &'s ServerConfig, path: &str) -> Option<(&'s str, &'s LocationConfig)> {
    server
        .locations
        .iter()
        .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(prefix, location)| (prefix.as_str(), location))
}

/// Splits a path into the CGI script name and trailing path info when it
/// names one of the location's CGI extensions.
pub fn cgi_split<'p>(location: &LocationConfig, path: &'p str) -> Option<(&'p str, &'p str)> {
    location.cgi_extensions.iter().find_map(|ext| {
        if ext.is_empty() {
            return None;
        }
        if path.ends_with(ext.as_str()) {
            return Some((path, ""));
        }
        path.find(&format!("{}/", ext)).map(|idx| path.split_at(idx + ext.len()))
    })
}

fn redirect_response(redirect: &Redirect, request_uri: &str) -> Response {
    Response::redirect(StatusCode(redirect.code), redirect.location_for(request_uri))
}

fn read_error_page(root: &Path, page: &str, status: StatusCode) -> Response {
    let path = root.join(page.trim_start_matches('/'));
    match std::fs::read(&path) {
        Ok(body) => Response::html(status, body),
        Err(e) => {
            warn!(page = %path.display(), error = %e, "error page configured but unreadable");
            Response::html(status, fallback_page(status))
        }
    }
}
