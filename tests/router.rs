use std::cell::RefCell;
use std::fs;
use std::path::Path;

use tempfile::TempDir;
use webserv::config::{ parse_config_str, GlobalConfig };
use webserv::handlers::cgi::{ CgiContext, CgiError, CgiHandler, ProcessCgi };
use webserv::http::{ fallback_page, Request, Response, StatusCode };
use webserv::router::Router;

struct Site {
    dir: TempDir,
    config: GlobalConfig,
}

impl Site {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn uploads(&self) -> std::path::PathBuf {
        self.dir.path().join("uploads")
    }

    fn handle(&self, raw: &str) -> Response {
        self.handle_with(&ProcessCgi, raw.as_bytes())
    }

    fn handle_with(&self, cgi: &dyn CgiHandler, raw: &[u8]) -> Response {
        let request = Request::parse(raw).expect("test request parses");
        Router::new(&self.config, cgi).handle_request(request)
    }
}

fn site(extra_locations: &str) -> Site {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("index.html"), "<h1>home</h1>").unwrap();
    fs::write(root.join("style.css"), "body{}").unwrap();
    fs::create_dir_all(root.join("files/sub")).unwrap();
    fs::write(root.join("files/a.txt"), "alpha").unwrap();
    fs::create_dir_all(root.join("uploads")).unwrap();
    fs::create_dir_all(root.join("errors")).unwrap();
    fs::write(root.join("errors/403.html"), "custom forbidden").unwrap();

    let yaml = format!(
        r#"
root: {root}
upload_dir: {root}/uploads
max_body_size: 16
servers:
  - listen: "127.0.0.1:3000"
    server_names: [example.local]
    error_pages:
      403: errors/403.html
    locations:
      /:
        methods: [GET, POST, DELETE]
      /files:
        autoindex: true
        methods: [GET]
      /uploads:
        methods: [POST, DELETE]
{extra_locations}
  - listen: "127.0.0.1:3001"
    redirect: {{ code: 301, to: "https://example.org$request_uri" }}
"#,
        root = root.display()
    );
    let config = parse_config_str(&yaml).unwrap();
    Site { dir, config }
}

fn body(response: &Response) -> String {
    String::from_utf8_lossy(&response.body).into_owned()
}

#[test]
fn index_is_served_for_root() {
    let site = site("");
    let response = site.handle("GET / HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.version, "HTTP/1.1");
    assert_eq!(response.header("server"), Some("webserv/0.1"));
    assert_eq!(body(&response), "<h1>home</h1>");
}

#[test]
fn missing_file_uses_fallback_page() {
    let site = site("");
    let response = site.handle("GET /missing HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(body(&response), fallback_page(StatusCode::NOT_FOUND));
}

#[test]
fn delete_removes_upload_and_lists_the_rest() {
    let site = site("");
    fs::write(site.uploads().join("test.txt"), "bye").unwrap();
    fs::write(site.uploads().join("keep.txt"), "stay").unwrap();

    let raw = "DELETE /uploads?filename=test.txt HTTP/1.1\r\nHost: localhost:3000\r\n\r\n";
    let response = site.handle(raw);
    assert_eq!(response.status, StatusCode::OK);
    assert!(!site.uploads().join("test.txt").exists());
    assert!(body(&response).contains("keep.txt"));
    assert!(!body(&response).contains("test.txt"));

    let again = site.handle(raw);
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(body(&again), body(&response));
}

#[test]
fn delete_decodes_file_name() {
    let site = site("");
    fs::write(site.uploads().join("my file.txt"), "x").unwrap();

    let response = site.handle("DELETE /uploads?filename=my%20file.txt HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert!(!site.uploads().join("my file.txt").exists());
}

#[test]
fn other_versions_are_a_teapot() {
    let site = site("");
    let response = site.handle("GET / HTTP/1.0\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
}

#[test]
fn unknown_host_is_not_found_without_cascade() {
    let site = site("");
    for raw in [
        "GET / HTTP/1.1\r\nHost: nowhere:3000\r\n\r\n",
        "GET / HTTP/1.1\r\n\r\n",
    ] {
        let response = site.handle(raw);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(body(&response), fallback_page(StatusCode::NOT_FOUND));
    }
}

#[test]
fn server_names_select_a_host() {
    let site = site("");
    let response = site.handle("GET / HTTP/1.1\r\nHost: example.local:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
}

#[test]
fn server_redirect_wins_over_locations() {
    let site = site("");
    let response = site.handle("GET /a?b=1 HTTP/1.1\r\nHost: localhost:3001\r\n\r\n");
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), Some("https://example.org/a?b=1"));
}

#[test]
fn location_redirect() {
    let site = site("      /old:\n        redirect: { code: 302, to: /new }");
    let response = site.handle("GET /old/page HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(response.header("location"), Some("/new"));
}

#[test]
fn method_restriction_and_asset_fast_path() {
    let site = site("      /static:\n        methods: []");
    let response = site.handle("DELETE /files/a.txt HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);

    fs::create_dir_all(site.root().join("static")).unwrap();
    fs::write(site.root().join("static/app.js"), "let x;").unwrap();
    let response = site.handle("GET /static/app.js HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("text/javascript"));

    let response = site.handle("GET /style.css HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.header("content-type"), Some("text/css"));
    assert_eq!(body(&response), "body{}");
}

#[test]
fn body_size_boundary() {
    let site = site("");
    let exact = format!(
        "POST /uploads?filename=b.txt HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: text/plain\r\nContent-Length: 16\r\n\r\n{}",
        "x".repeat(16)
    );
    assert_eq!(site.handle(&exact).status, StatusCode::CREATED);

    let over = format!(
        "POST /uploads?filename=b.txt HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: text/plain\r\nContent-Length: 17\r\n\r\n{}",
        "x".repeat(17)
    );
    assert_eq!(site.handle(&over).status, StatusCode::CONTENT_TOO_LARGE);
}

#[test]
fn multipart_upload_gets_unique_names() {
    let site = site("");
    let payload = "--XyZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        hi\r\n\
        --XyZ--\r\n";
    let raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: multipart/form-data; boundary=XyZ\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    );

    let mut site = site;
    site.config.max_body_size = 1024;
    assert_eq!(site.handle(&raw).status, StatusCode::OK);
    let second = site.handle(&raw);
    assert_eq!(second.status, StatusCode::OK);

    assert_eq!(fs::read_to_string(site.uploads().join("note.txt")).unwrap(), "hi");
    assert_eq!(fs::read_to_string(site.uploads().join("note_2.txt")).unwrap(), "hi");
    assert!(body(&second).contains("note_2.txt"));
}

#[test]
fn post_edge_cases() {
    let site = site("");
    let empty = "POST /uploads HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: text/plain\r\n\r\n";
    assert_eq!(site.handle(empty).status, StatusCode::BAD_REQUEST);

    let json = "POST /uploads HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
    assert_eq!(site.handle(json).status, StatusCode::BAD_REQUEST);

    let form = "POST / HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 14\r\n\r\ntext_input=a+b";
    let response = site.handle(form);
    assert_eq!(response.status, StatusCode::OK);
    assert!(body(&response).contains("text_input = a b"));
}

#[test]
fn autoindex_lists_and_redirects_bare_directory() {
    let site = site("");
    let response = site.handle("GET /files HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), Some("/files/"));

    let response = site.handle("GET /files/ HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    let listing = body(&response);
    let sub = listing.find("sub/").unwrap();
    let file = listing.find("a.txt").unwrap();
    assert!(sub < file);
}

#[test]
fn directory_without_index_or_autoindex_uses_error_page() {
    let site = site("");
    fs::create_dir_all(site.root().join("plain")).unwrap();
    let response = site.handle("GET /plain/ HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(body(&response), "custom forbidden");
}

#[test]
fn traversal_is_forbidden() {
    let site = site("");
    let response = site.handle("GET /files/../../etc/passwd HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    let response = site.handle("GET /files/%2e%2e/x HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[test]
fn location_error_page_beats_server_and_global() {
    let site = site("      /private:\n        error_pages: { 404: errors/private404.html }");
    fs::write(site.root().join("errors/private404.html"), "private missing").unwrap();

    let response = site.handle("GET /private/nothing HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(body(&response), "private missing");

    let response = site.handle("GET /nothing HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(body(&response), fallback_page(StatusCode::NOT_FOUND));
}

/// Records the script it was asked to run and answers with a fixed page.
#[derive(Default)]
struct RecordingCgi {
    seen: RefCell<Vec<(String, String)>>,
    roots: RefCell<Vec<std::path::PathBuf>>,
    fail: bool,
}

impl CgiHandler for RecordingCgi {
    fn execute(&self, ctx: &CgiContext<'_>, response: &mut Response) -> Result<(), CgiError> {
        self.seen.borrow_mut().push((ctx.script_name.to_string(), ctx.path_info.to_string()));
        self.roots.borrow_mut().push(ctx.root.to_path_buf());
        if self.fail {
            return Err(CgiError::Output("no header terminator".into()));
        }
        response.set_body("text/plain", "from cgi");
        Ok(())
    }
}

#[test]
fn cgi_is_delegated_through_the_capability() {
    let site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.py]");
    fs::create_dir_all(site.root().join("cgi-bin")).unwrap();
    fs::write(site.root().join("cgi-bin/run.py"), "print('x')").unwrap();

    let cgi = RecordingCgi::default();
    let raw = b"GET /cgi-bin/run.py/extra?q=1 HTTP/1.1\r\nHost: localhost:3000\r\n\r\n";
    let response = site.handle_with(&cgi, raw);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body(&response), "from cgi");
    assert_eq!(cgi.seen.borrow().as_slice(), &[("/cgi-bin/run.py".to_string(), "/extra".to_string())]);
    assert_eq!(cgi.roots.borrow().as_slice(), &[site.root().to_path_buf()]);

    let missing = site.handle_with(&cgi, b"GET /cgi-bin/nope.py HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let failing = RecordingCgi { fail: true, ..RecordingCgi::default() };
    let response = site.handle_with(&failing, raw);
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[cfg(unix)]
#[test]
fn process_cgi_runs_a_real_script() {
    let site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.sh]\n        cgi_interpreter: /bin/sh");
    fs::create_dir_all(site.root().join("cgi-bin")).unwrap();
    fs::write(
        site.root().join("cgi-bin/hello.sh"),
        "printf 'Status: 202 Accepted\\r\\nContent-Type: text/plain\\r\\n\\r\\nquery=%s' \"$QUERY_STRING\"\n",
    )
    .unwrap();

    let response = site.handle("GET /cgi-bin/hello.sh?x=1 HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode(202));
    assert_eq!(body(&response), "query=x=1");
}

#[test]
fn cgi_document_root_follows_the_location_root() {
    let mut site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.py]");
    let alt = site.root().join("alt");
    fs::create_dir_all(alt.join("cgi-bin")).unwrap();
    fs::write(alt.join("cgi-bin/run.py"), "print('x')").unwrap();
    site.config.servers[0].locations.get_mut("/cgi-bin").unwrap().root = Some(alt.clone());

    let cgi = RecordingCgi::default();
    let response = site.handle_with(&cgi, b"GET /cgi-bin/run.py HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(cgi.roots.borrow().as_slice(), &[alt]);
}

#[cfg(unix)]
#[test]
fn process_cgi_sees_the_resolved_document_root() {
    let mut site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.sh]\n        cgi_interpreter: /bin/sh");
    let alt = site.root().join("alt");
    fs::create_dir_all(alt.join("cgi-bin")).unwrap();
    fs::write(
        alt.join("cgi-bin/root.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\n%s' \"$DOCUMENT_ROOT\"\n",
    )
    .unwrap();
    site.config.servers[0].locations.get_mut("/cgi-bin").unwrap().root = Some(alt.clone());

    let response = site.handle("GET /cgi-bin/root.sh HTTP/1.1\r\nHost: localhost:3000\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body(&response), alt.display().to_string());
}

#[cfg(unix)]
#[test]
fn process_cgi_echoes_a_body_larger_than_a_pipe_buffer() {
    let mut site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.sh]\n        cgi_interpreter: /bin/sh");
    site.config.max_body_size = 1024 * 1024;
    fs::create_dir_all(site.root().join("cgi-bin")).unwrap();
    fs::write(site.root().join("cgi-bin/echo.sh"), "printf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n").unwrap();

    let payload: Vec<u8> = (0..200 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    let mut raw = format!(
        "POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost:3000\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    raw.extend_from_slice(&payload);

    let response = site.handle_with(&ProcessCgi, &raw);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.len(), payload.len());
    assert!(response.body == payload);
}

#[cfg(unix)]
#[test]
fn process_cgi_that_ignores_its_input_still_answers() {
    let mut site = site("      /cgi-bin:\n        cgi: true\n        cgi_extensions: [.sh]\n        cgi_interpreter: /bin/sh");
    site.config.max_body_size = 1024 * 1024;
    fs::create_dir_all(site.root().join("cgi-bin")).unwrap();
    fs::write(site.root().join("cgi-bin/quick.sh"), "printf 'Content-Type: text/plain\\r\\n\\r\\ndone'\n").unwrap();

    let payload = vec![b'x'; 300 * 1024];
    let mut raw = format!(
        "POST /cgi-bin/quick.sh HTTP/1.1\r\nHost: localhost:3000\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    raw.extend_from_slice(&payload);

    let response = site.handle_with(&ProcessCgi, &raw);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body(&response), "done");
}
