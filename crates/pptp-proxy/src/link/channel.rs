//! One side's TCP control connection.
//!
//! Both the dispatch loop (forwarded control messages) and the GRE task
//! (PPTP-IN-TCP frames) write to a channel, so writes are serialized by an
//! async mutex and always complete a whole buffer before releasing it.
//! Every write is bounded in time: an endpoint that stops reading must not
//! stall the other context. A write that times out after sending part of
//! its buffer shuts the socket down, since the stream can no longer be
//! framed; the dispatch loop then sees the close and removes the link.

use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

/// Limit for forwarding one control message.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ControlChannel {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write_lock: Mutex::new(()),
        }
    }

    /// Wait until the socket has data (or EOF/error) to read.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Non-blocking read; `WouldBlock` when readiness was spurious.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    /// Write the whole buffer within [`WRITE_TIMEOUT`].
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.write_all_within(data, WRITE_TIMEOUT).await
    }

    /// Write the whole buffer, retrying partial writes, or fail with
    /// `TimedOut` once `limit` has passed. Waiting for another writer
    /// counts against the limit.
    pub async fn write_all_within(&self, data: &[u8], limit: Duration) -> io::Result<()> {
        let deadline = Instant::now() + limit;
        let _guard = timeout_at(deadline, self.write_lock.lock())
            .await
            .map_err(|_| timed_out("control channel busy"))?;

        let mut rest = data;
        while !rest.is_empty() {
            if timeout_at(deadline, self.stream.writable()).await.is_err() {
                if rest.len() < data.len() {
                    // half a message is on the wire
                    let _ = SockRef::from(&self.stream).shutdown(Shutdown::Both);
                }
                return Err(timed_out("peer is not reading its control connection"));
            }
            match self.stream.try_write(rest) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "wrote 0 bytes on control socket",
                    ))
                }
                Ok(n) => rest = &rest[n..],
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn timed_out(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::socket_pair;
    use tokio::io::AsyncReadExt;

    const SHORT: Duration = Duration::from_millis(50);

    /// Write until the endpoint's buffers are full and a write times out.
    async fn fill(channel: &ControlChannel) -> io::Error {
        let chunk = vec![0x5Au8; 64 * 1024];
        loop {
            if let Err(e) = channel.write_all_within(&chunk, SHORT).await {
                return e;
            }
        }
    }

    #[tokio::test]
    async fn stalled_reader_times_out() {
        let (relay, _endpoint) = socket_pair().await;
        let channel = ControlChannel::new(relay);

        let err = tokio::time::timeout(Duration::from_secs(30), fill(&channel))
            .await
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Still stalled (or shut down): the next write fails instead of waiting.
        let more = channel.write_all_within(b"more", SHORT);
        let result = tokio::time::timeout(Duration::from_secs(5), more).await;
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn write_reaches_a_reading_endpoint() {
        let (relay, mut endpoint) = socket_pair().await;
        let channel = ControlChannel::new(relay);

        channel.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        endpoint.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
