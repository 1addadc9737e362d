//! Socket abstractions.
//!
//! [`TcpStream`] and [`TcpListener`] are implemented for both `mio::net::*`
//! (the reactor's real sockets) and `std::net::*`, and, under `cfg(test)`,
//! for an in-memory [`mock`] pair — so the admission, keep-alive, and
//! lifecycle state machines can be driven without opening a real socket.

pub mod tcp_listener;
pub mod tcp_stream;

#[cfg(test)]
pub mod mock;

pub use tcp_listener::TcpListener;
pub use tcp_stream::TcpStream;
