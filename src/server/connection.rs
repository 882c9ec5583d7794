use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{ self, Read, Write };
use std::net::SocketAddr;
use std::os::unix::io::{ AsRawFd, RawFd };
use std::time::{ Duration, Instant };

/// Bytes read from the socket per `recv` call.
pub const READ_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Reading,
    Routing,
    Writing,
    Closed,
}

/// Outcome of one non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv {
    Data(usize),
    WouldBlock,
    /// The peer closed its side.
    Eof,
}

/// State of one accepted client connection. Dropping it closes the socket.
pub struct Session {
    stream: TcpStream,
    pub peer: SocketAddr,
    /// Address of the listener that accepted this session.
    pub local: SocketAddr,
    pub inbound: Vec<u8>,
    outbound: VecDeque<Vec<u8>>,
    pub state: SessionState,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            local,
            inbound: Vec::with_capacity(READ_CHUNK_SIZE),
            outbound: VecDeque::new(),
            state: SessionState::Reading,
            last_activity: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// One read of up to [`READ_CHUNK_SIZE`] bytes appended to `inbound`.
    pub fn recv(&mut self) -> io::Result<Recv> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.state = SessionState::Closed;
                Ok(Recv::Eof)
            }
            Ok(n) => {
                self.inbound.extend_from_slice(&buf[..n]);
                self.last_activity = Instant::now();
                Ok(Recv::Data(n))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Recv::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(Recv::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Appends a serialized response block to the outbound queue.
    pub fn queue(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.outbound.push_back(bytes);
        }
        self.state = SessionState::Writing;
    }

    /// Writes the head of the outbound queue. A partial write puts the
    /// remainder back at the front. Returns true once the queue is empty.
    pub fn send(&mut self) -> io::Result<bool> {
        let Some(mut block) = self.outbound.pop_front() else {
            return Ok(true);
        };
        match self.stream.write(&block) {
            Ok(n) => {
                self.last_activity = Instant::now();
                if n < block.len() {
                    block.drain(..n);
                    self.outbound.push_front(block);
                }
            }
            Err(e) => {
                self.outbound.push_front(block);
                if e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }
        }
        Ok(self.outbound.is_empty())
    }

    /// Bytes still waiting in the outbound queue.
    pub fn pending_bytes(&self) -> usize {
        self.outbound.iter().map(Vec::len).sum()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
