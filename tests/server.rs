use std::fs;
use std::io::{ Read, Write };
use std::net::{ TcpListener, TcpStream };
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use webserv::config::parse_config_str;
use webserv::handlers::cgi::ProcessCgi;
use webserv::Server;

struct Running {
    port: u16,
    dir: TempDir,
}

fn free_port() -> u16 {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Starts a server on its own thread. `globals` is spliced into the top of
/// the YAML configuration.
fn spawn_server(globals: &str) -> Running {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<h1>live</h1>").unwrap();
    fs::create_dir_all(dir.path().join("uploads")).unwrap();

    let port = free_port();
    let yaml = format!(
        r#"
root: {root}
upload_dir: {root}/uploads
{globals}
servers:
  - listen: "127.0.0.1:{port}"
    locations:
      /:
        methods: [GET, POST, DELETE]
"#,
        root = dir.path().display()
    );
    let config = parse_config_str(&yaml).unwrap();

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = Server::new(config, Box::new(ProcessCgi)).unwrap();
        server.bind().unwrap();
        ready_tx.send(()).unwrap();
        server.run().unwrap();
    });
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    Running { port, dir }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

fn read_all(mut stream: TcpStream) -> String {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn exchange(port: u16, request: &[u8]) -> String {
    let mut stream = connect(port);
    stream.write_all(request).unwrap();
    read_all(stream)
}

#[test]
fn serves_index_over_tcp() {
    let server = spawn_server("");
    let request = format!("GET / HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", server.port);
    let response = exchange(server.port, request.as_bytes());

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Server: webserv/0.1\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("Content-Length: 13\r\n"));
    assert!(response.ends_with("\r\n\r\n<h1>live</h1>"));
}

#[test]
fn protocol_errors_still_get_a_response() {
    let server = spawn_server("");

    let response = exchange(server.port, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 418 "), "{}", response);

    let response = exchange(server.port, b"NONSENSE\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let response = exchange(server.port, b"PUT / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{}", response);
}

#[test]
fn body_split_across_writes_is_framed_by_content_length() {
    let server = spawn_server("");
    let body = "y".repeat(3000);
    let head = format!(
        "POST /?filename=big.txt HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        server.port,
        body.len()
    );

    let mut stream = connect(server.port);
    stream.write_all(head.as_bytes()).unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(&body.as_bytes()[..1000]).unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(&body.as_bytes()[1000..]).unwrap();

    let response = read_all(stream);
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{}", response);
    let stored = fs::read_to_string(server.dir.path().join("uploads/big.txt")).unwrap();
    assert_eq!(stored.len(), 3000);
}

#[test]
fn oversized_request_is_rejected() {
    let server = spawn_server("max_request_bytes: 1024");
    let body = "z".repeat(1200);
    let request = format!(
        "POST / HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        server.port,
        body.len(),
        body
    );
    assert!(request.len() > 1024);

    let response = exchange(server.port, request.as_bytes());
    assert!(response.starts_with("HTTP/1.1 413 Content Too Large\r\n"), "{}", response);
}

#[test]
fn huge_content_length_does_not_kill_the_loop() {
    let server = spawn_server("");
    let response = exchange(
        server.port,
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 18446744073709551615\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let request = format!("GET / HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", server.port);
    let response = exchange(server.port, request.as_bytes());
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
}

#[test]
fn declared_length_over_the_cap_is_rejected_before_the_body() {
    let server = spawn_server("max_request_bytes: 1024");
    let head = format!(
        "POST / HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: text/plain\r\nContent-Length: 5000\r\n\r\n",
        server.port
    );
    // Only the head is sent; the 413 must not wait for the body.
    let response = exchange(server.port, head.as_bytes());
    assert!(response.starts_with("HTTP/1.1 413 Content Too Large\r\n"), "{}", response);
}

#[test]
fn a_stalled_client_does_not_block_others() {
    let server = spawn_server("");

    let mut slow = connect(server.port);
    slow.write_all(b"GET / HTTP/1.1\r\nHo").unwrap();

    let request = format!("GET / HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", server.port);
    let response = exchange(server.port, request.as_bytes());
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    slow.write_all(format!("st: localhost:{}\r\n\r\n", server.port).as_bytes()).unwrap();
    assert!(read_all(slow).starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn idle_sessions_are_evicted() {
    let server = spawn_server("timeout_seconds: 1");
    let idle = connect(server.port);
    let mut buf = Vec::new();
    let read = (&idle).read_to_end(&mut buf).unwrap();
    assert_eq!(read, 0);
}
