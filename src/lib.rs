//! ADB wire-protocol client: framing, the CNXN/AUTH/STLS handshake, and a
//! multiplexed stream layer on top of a caller-supplied transport.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod proto;
pub mod stream;
pub mod transport;

pub use auth::AuthKey;
pub use connection::Connection;
pub use error::{AdbError, AdbResult};
pub use proto::Packet;
pub use stream::{Stream, StreamWriter};
pub use transport::Transport;
