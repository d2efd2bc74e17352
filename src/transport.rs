//! The byte-oriented, reliable, in-order transport a [`crate::connection::Connection`]
//! is bound to. `TcpStream` is the production transport; tests use an
//! in-memory duplex pipe so the handshake and multiplexer can be driven by
//! a scripted peer without a real socket.

use std::io::{self, Read, Write};
use std::net::TcpStream;

/// A transport the Connection can own, split into an independent read half
/// (handed to the reader thread) and write half (kept by the writer thread)
/// via `try_clone`.
pub trait Transport: Read + Write + Send + 'static {
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }
}
