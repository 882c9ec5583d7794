pub mod poll;
pub mod socket;

pub use poll::{ Event, Multiplexer };
pub use socket::{ bind, BindError, BoundSocket, Listener, LISTEN_BACKLOG };
