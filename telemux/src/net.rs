//! Network transport.
//!
//! A mio-based TCP reactor: one accept thread hands connections round-robin
//! to a fixed set of event-loop threads, each owning its connections and
//! their frame codecs.

pub mod endpoint;
pub mod reactor;
pub mod socket;

pub use endpoint::Endpoint;
pub use reactor::{ConnInfo, EventHandler, Reactor, ReactorConfig};
pub use socket::{TcpListener, TcpStream};
