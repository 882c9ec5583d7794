use mio::net::UnixStream;
use mio::unix::SourceFd;
use mio::{ Events, Interest, Poll, Token };
use std::collections::{ HashMap, VecDeque };
use std::io::{ self, Read };
use std::os::raw::c_int;
use std::os::unix::io::{ AsRawFd, RawFd };
use std::time::Duration;
use tracing::warn;

const EVENTS_CAPACITY: usize = 1024;

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(RawFd),
    Writable(RawFd),
    Error(RawFd),
    /// A registered signal arrived; carries the signal number.
    Signal(c_int),
    /// The wait timed out or was interrupted.
    None,
}

/// Readiness multiplexer handing out one event per [`Multiplexer::wait`].
///
/// Every event of a poll round is queued and handed out in order before the
/// next round starts, so no ready descriptor waits behind a busy one for
/// more than a round.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    pending: VecDeque<Event>,
    interests: HashMap<RawFd, Interest>,
    signals: HashMap<Token, SignalPipe>,
}

struct SignalPipe {
    signal: c_int,
    reader: UnixStream,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            pending: VecDeque::new(),
            interests: HashMap::new(),
            signals: HashMap::new(),
        })
    }

    /// Adds `interest` for `fd`. Already registered interest is a no-op.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        match self.interests.get(&fd).copied() {
            Some(current) => {
                let wanted = current | interest;
                if wanted != current {
                    registry.reregister(&mut SourceFd(&fd), token_for(fd), wanted)?;
                    self.interests.insert(fd, wanted);
                }
            }
            None => {
                registry.register(&mut SourceFd(&fd), token_for(fd), interest)?;
                self.interests.insert(fd, interest);
            }
        }
        Ok(())
    }

    /// Drops `interest` for `fd`; dropping the last interest deregisters it.
    pub fn unregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(current) = self.interests.get(&fd).copied() else {
            return Ok(());
        };
        match current.remove(interest) {
            Some(rest) if rest == current => {}
            Some(rest) => {
                self.poll.registry().reregister(&mut SourceFd(&fd), token_for(fd), rest)?;
                self.interests.insert(fd, rest);
            }
            None => self.remove(fd)?,
        }
        Ok(())
    }

    /// Forgets `fd` entirely, including events already queued for it.
    /// Must run before the descriptor is closed. Unknown descriptors are a
    /// no-op.
    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.pending.retain(|event| event_fd(event) != Some(fd));
        if self.interests.remove(&fd).is_some() {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&fd)
    }

    /// Surfaces `signal` as [`Event::Signal`] instead of its default action.
    pub fn register_signal(&mut self, signal: c_int) -> io::Result<()> {
        let (reader, writer) = std::os::unix::net::UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        signal_hook::low_level::pipe::register(signal, writer)?;

        let mut reader = UnixStream::from_std(reader);
        let token = Token(usize::MAX - self.signals.len());
        self.poll.registry().register(&mut reader, token, Interest::READABLE)?;
        self.signals.insert(token, SignalPipe { signal, reader });
        Ok(())
    }

    /// Blocks until an event is ready or `timeout` passes.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Event> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Event::None),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            if let Some(pipe) = self.signals.get_mut(&token) {
                drain(&mut pipe.reader);
                self.pending.push_back(Event::Signal(pipe.signal));
                continue;
            }

            let fd = token.0 as RawFd;
            if !self.interests.contains_key(&fd) {
                continue;
            }
            if event.is_error() {
                self.pending.push_back(Event::Error(fd));
                continue;
            }
            // A peer hang-up shows up as a read of zero bytes.
            if event.is_readable() || event.is_read_closed() {
                self.pending.push_back(Event::Readable(fd));
            }
            if event.is_writable() {
                self.pending.push_back(Event::Writable(fd));
            } else if event.is_write_closed() && !event.is_readable() {
                self.pending.push_back(Event::Error(fd));
            }
        }

        Ok(self.pending.pop_front().unwrap_or(Event::None))
    }
}

fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

fn event_fd(event: &Event) -> Option<RawFd> {
    match *event {
        Event::Readable(fd) | Event::Writable(fd) | Event::Error(fd) => Some(fd),
        Event::Signal(_) | Event::None => None,
    }
}

fn drain(reader: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(fd = reader.as_raw_fd(), error = %e, "signal pipe read failed");
                break;
            }
        }
    }
}
