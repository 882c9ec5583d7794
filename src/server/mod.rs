//! The single-threaded event loop: owns the listeners, the live sessions and
//! the multiplexer, and drives every session from accept to close.

pub mod connection;

use crate::config::models::GlobalConfig;
use crate::handlers::cgi::CgiHandler;
use crate::http::request::{ ParseError, Request };
use crate::http::response::StatusCode;
use crate::network::poll::{ Event, Multiplexer };
use crate::network::socket::{ self, BindError, Listener };
use crate::router::Router;
use crate::server::connection::{ Recv, Session, SessionState };

use mio::Interest;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{ Duration, Instant };
use thiserror::Error;
use tracing::{ debug, error, info, warn };

/// Longest time the loop sleeps before checking for idle sessions.
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no listening socket could be bound")]
    NoListeners,
    #[error("multiplexer failure: {0}")]
    Io(#[from] io::Error),
}

pub struct Server {
    config: GlobalConfig,
    cgi: Box<dyn CgiHandler>,
    mux: Multiplexer,
    listeners: HashMap<RawFd, Listener>,
    sessions: HashMap<RawFd, Session>,
    shutting_down: bool,
    last_sweep: Instant,
}

/// Where a read pass over one session ended up.
enum ReadOutcome {
    Pending,
    Complete(usize),
    Reject(StatusCode),
    Closed,
}

impl Server {
    pub fn new(config: GlobalConfig, cgi: Box<dyn CgiHandler>) -> Result<Self, ServerError> {
        Ok(Self {
            config,
            cgi,
            mux: Multiplexer::new()?,
            listeners: HashMap::new(),
            sessions: HashMap::new(),
            shutting_down: false,
            last_sweep: Instant::now(),
        })
    }

    /// Binds every virtual host and installs the SIGINT/SIGTERM handlers.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.bind()?;
        self.mux.register_signal(libc::SIGINT)?;
        self.mux.register_signal(libc::SIGTERM)?;
        Ok(())
    }

    /// Opens one listener per virtual host. A host that fails to bind is
    /// logged and skipped; having none at all is an error.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        for server in &self.config.servers {
            let listen = &server.listen;
            match open_listener(&mut self.mux, &listen.address, listen.port) {
                Ok(listener) => {
                    info!(addr = %listener.addr(), names = ?server.server_names, "listening");
                    self.listeners.insert(listener.fd(), listener);
                }
                Err(e) => error!(listen = %listen, error = %e, "skipping virtual host"),
            }
        }

        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.listeners.values().map(Listener::addr).collect();
        addrs.sort();
        addrs
    }

    /// Runs until a shutdown signal has been handled.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(listeners = self.listeners.len(), "event loop started");

        loop {
            if self.shutting_down && self.sessions.is_empty() {
                break;
            }

            match self.mux.wait(Some(TICK))? {
                Event::Readable(fd) => {
                    if self.listeners.contains_key(&fd) {
                        self.accept(fd);
                    } else {
                        self.read(fd);
                    }
                }
                Event::Writable(fd) => self.write(fd),
                Event::Error(fd) => {
                    if self.listeners.contains_key(&fd) {
                        warn!(fd, "error condition on listener");
                    } else {
                        debug!(fd, "socket error");
                        self.close_session(fd);
                    }
                }
                Event::Signal(signal) => {
                    if self.shutting_down {
                        warn!(signal, "second signal, exiting now");
                        break;
                    }
                    self.begin_shutdown(signal);
                }
                Event::None => {}
            }

            self.evict_idle();
        }

        self.close_all();
        info!("event loop stopped");
        Ok(())
    }

    fn accept(&mut self, fd: RawFd) {
        let Some(listener) = self.listeners.get(&fd) else {
            return;
        };
        // Edge-triggered: take every pending connection now.
        loop {
            match listener.accept() {
                Ok(Some(session)) => {
                    let session_fd = session.fd();
                    if let Err(e) = self.mux.register(session_fd, Interest::READABLE) {
                        warn!(peer = %session.peer, error = %e, "cannot watch new session");
                        continue;
                    }
                    debug!(peer = %session.peer, fd = session_fd, "accepted");
                    self.sessions.insert(session_fd, session);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(addr = %listener.addr(), error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn read(&mut self, fd: RawFd) {
        let Some(session) = self.sessions.get_mut(&fd) else {
            return;
        };
        if session.state != SessionState::Reading {
            return;
        }

        let max_request = self.config.max_request_bytes;
        let outcome = loop {
            match session.recv() {
                Ok(Recv::Data(_)) => match Request::message_len(&session.inbound) {
                    Ok(Some(len)) if len > max_request => break ReadOutcome::Reject(StatusCode::CONTENT_TOO_LARGE),
                    Ok(Some(len)) => break ReadOutcome::Complete(len),
                    Ok(None) if session.inbound.len() > max_request => {
                        break ReadOutcome::Reject(StatusCode::CONTENT_TOO_LARGE);
                    }
                    Ok(None) => match Request::declared_len(&session.inbound) {
                        Ok(Some(len)) if len > max_request => {
                            break ReadOutcome::Reject(StatusCode::CONTENT_TOO_LARGE);
                        }
                        _ => continue,
                    },
                    Err(e) => {
                        debug!(peer = %session.peer, error = %e, "unframeable request");
                        break ReadOutcome::Reject(status_for(&e));
                    }
                },
                Ok(Recv::WouldBlock) => break ReadOutcome::Pending,
                Ok(Recv::Eof) => break ReadOutcome::Closed,
                Err(e) => {
                    debug!(peer = %session.peer, error = %e, "read failed");
                    break ReadOutcome::Closed;
                }
            }
        };

        let router = Router::new(&self.config, self.cgi.as_ref());
        let response = match outcome {
            ReadOutcome::Pending => return,
            ReadOutcome::Closed => {
                self.close_session(fd);
                return;
            }
            ReadOutcome::Reject(status) => {
                info!(peer = %session.peer, status = status.as_u16(), "request rejected");
                router.reject(status)
            }
            ReadOutcome::Complete(len) => {
                session.state = SessionState::Routing;
                match Request::parse(&session.inbound[..len]) {
                    Ok(request) => {
                        let (method, uri) = (request.method, request.uri.clone());
                        let response = router.handle_request(request);
                        info!(
                            peer = %session.peer,
                            %method,
                            %uri,
                            status = response.status.as_u16(),
                            bytes = response.body.len(),
                            "request"
                        );
                        response
                    }
                    Err(e) => {
                        debug!(peer = %session.peer, error = %e, "unparseable request");
                        router.reject(status_for(&e))
                    }
                }
            }
        };

        session.inbound.clear();
        session.queue(response.serialize());
        if let Err(e) = self.switch_to_writing(fd) {
            warn!(fd, error = %e, "cannot watch session for writing");
            self.close_session(fd);
        }
    }

    fn switch_to_writing(&mut self, fd: RawFd) -> io::Result<()> {
        // Add first so the descriptor never drops out of the multiplexer.
        self.mux.register(fd, Interest::WRITABLE)?;
        self.mux.unregister(fd, Interest::READABLE)
    }

    fn write(&mut self, fd: RawFd) {
        let Some(session) = self.sessions.get_mut(&fd) else {
            return;
        };
        if session.state != SessionState::Writing {
            return;
        }

        let done = loop {
            let before = session.pending_bytes();
            match session.send() {
                Ok(true) => break true,
                Ok(false) if session.pending_bytes() == before => break false,
                Ok(false) => continue,
                Err(e) => {
                    debug!(peer = %session.peer, error = %e, "write failed");
                    break true;
                }
            }
        };

        if done {
            self.close_session(fd);
        }
    }

    /// Deregisters, then drops the session, which closes its socket.
    fn close_session(&mut self, fd: RawFd) {
        let Some(mut session) = self.sessions.remove(&fd) else {
            return;
        };
        if let Err(e) = self.mux.remove(fd) {
            warn!(fd, error = %e, "deregister failed");
        }
        session.state = SessionState::Closed;
        debug!(peer = %session.peer, fd, "session closed");
    }

    fn close_listener(&mut self, fd: RawFd) {
        let Some(listener) = self.listeners.remove(&fd) else {
            return;
        };
        if let Err(e) = self.mux.remove(fd) {
            warn!(fd, error = %e, "deregister failed");
        }
        info!(addr = %listener.addr(), "listener closed");
    }

    fn evict_idle(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < TICK || self.config.timeout_seconds == 0 {
            return;
        }
        self.last_sweep = now;

        let limit = Duration::from_secs(self.config.timeout_seconds);
        let idle: Vec<RawFd> = self.sessions
            .iter()
            .filter(|(_, session)| session.idle_for(now) > limit)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in idle {
            if let Some(session) = self.sessions.get(&fd) {
                info!(peer = %session.peer, state = ?session.state, "idle session evicted");
            }
            self.close_session(fd);
        }
    }

    /// Stops accepting and reading; responses already queued still drain.
    fn begin_shutdown(&mut self, signal: i32) {
        info!(signal, in_flight = self.sessions.len(), "shutting down");
        self.shutting_down = true;

        let listeners: Vec<RawFd> = self.listeners.keys().copied().collect();
        for fd in listeners {
            self.close_listener(fd);
        }
        let reading: Vec<RawFd> = self.sessions
            .iter()
            .filter(|(_, session)| session.state != SessionState::Writing)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in reading {
            self.close_session(fd);
        }
    }

    fn close_all(&mut self) {
        let listeners: Vec<RawFd> = self.listeners.keys().copied().collect();
        for fd in listeners {
            self.close_listener(fd);
        }
        let sessions: Vec<RawFd> = self.sessions.keys().copied().collect();
        for fd in sessions {
            self.close_session(fd);
        }
    }
}

fn open_listener(mux: &mut Multiplexer, address: &str, port: u16) -> Result<Listener, BindError> {
    let listener = socket::bind(address, port)?.listen()?;
    mux.register(listener.fd(), Interest::READABLE).map_err(|source| BindError::Register {
        addr: listener.addr(),
        source,
    })?;
    Ok(listener)
}

fn status_for(error: &ParseError) -> StatusCode {
    match error {
        ParseError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_REQUEST,
    }
}
