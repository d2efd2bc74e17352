//! The error taxonomy surfaced by the protocol engine. Reader/writer thread
//! failures never reach a caller directly; they tear the Connection down
//! and resurface as [`AdbError::ConnectionClosed`] (or end-of-stream) at the
//! next blocked call. The handshake is synchronous and propagates its
//! errors straight to the caller of [`crate::connection::Connection::connect`].

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("transport I/O error: {0}")]
    TransportError(#[source] io::Error),

    #[error("transport closed mid-frame")]
    Truncated,

    #[error("peer requested the TLS (STLS) handshake variant, which is not supported")]
    TlsUnsupported,

    #[error("handshake rejected by peer: expected CNXN, got command {0:#010x}")]
    HandshakeRejected(u32),

    #[error("RSA signing failed: {0}")]
    SigningFailed(String),

    #[error("peer rejected stream open before sending OKAY")]
    OpenRejected,

    #[error("connection is closed")]
    ConnectionClosed,
}

pub type AdbResult<T> = Result<T, AdbError>;
