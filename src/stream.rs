//! A single logical byte stream multiplexed over a [`crate::connection::Connection`].

use crossbeam_channel::Receiver;
use std::io;
use std::sync::Arc;

use crate::connection::{Delivery, Shared};
use crate::proto::{Packet, A_CLSE, A_WRTE};

/// A bidirectional byte channel opened against one named service on the
/// peer. Implements [`std::io::Read`] and [`std::io::Write`] so it can be
/// used anywhere a generic byte stream is expected (e.g. `std::io::copy`).
pub struct Stream {
    local_id: u32,
    remote_id: u32,
    shared: Arc<Shared>,
    delivery_rx: Receiver<Delivery>,
    /// Tail of the last dequeued chunk not yet handed to a caller.
    residual: Vec<u8>,
}

impl Stream {
    pub(crate) fn new(local_id: u32, remote_id: u32, shared: Arc<Shared>, delivery_rx: Receiver<Delivery>) -> Self {
        Stream { local_id, remote_id, shared, delivery_rx, residual: Vec::new() }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// A cheap, cloneable write-only handle sharing this stream's identity
    /// and outbound queue, so a caller can hand writes to one thread while
    /// reading on another (e.g. relaying stdin while pumping output to
    /// stdout).
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            local_id: self.local_id,
            remote_id: self.remote_id,
            outbound_tx: self.shared.outbound_tx.clone(),
        }
    }

    /// Remove this stream from the connection's table and, if this call
    /// was the one that actually removed it, tell the peer. A stream
    /// already closed by the peer (or by connection teardown) makes this
    /// a no-op success, matching §4.4.
    pub fn close(&self) -> Result<(), crate::error::AdbError> {
        let removed = self.shared.streams.lock().unwrap().remove(&self.local_id).is_some();
        if removed {
            let pkt = Packet::new(A_CLSE, self.local_id, self.remote_id, Vec::new());
            // Best effort: if the outbound queue is already gone the
            // connection is torn down anyway, which is still a success
            // from this stream's point of view.
            let _ = self.shared.outbound_tx.send(pkt);
        }
        Ok(())
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.residual.is_empty() {
                let n = buf.len().min(self.residual.len());
                buf[..n].copy_from_slice(&self.residual[..n]);
                self.residual.drain(..n);
                return Ok(n);
            }
            match self.delivery_rx.recv() {
                Ok(Delivery::Data(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.residual = chunk;
                }
                Ok(Delivery::Opened(_)) => continue, // stray post-open marker, ignore
                Err(_) => return Ok(0),               // delivery queue closed: end-of-stream
            }
        }
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pkt = Packet::new(A_WRTE, self.local_id, self.remote_id, buf.to_vec());
        self.shared
            .outbound_tx
            .send(pkt)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The write half split off a [`Stream`] by [`Stream::writer`]. Send-only,
/// cloneable, independent of the stream's delivery queue.
pub struct StreamWriter {
    local_id: u32,
    remote_id: u32,
    outbound_tx: crossbeam_channel::Sender<Packet>,
}

impl io::Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pkt = Packet::new(A_WRTE, self.local_id, self.remote_id, buf.to_vec());
        self.outbound_tx
            .send(pkt)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
