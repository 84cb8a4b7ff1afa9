//! IPC primitive based on a duplex Unix domain socket.
//!
//! `std::os::unix::net::UnixStream::pair()` is backed by `socketpair(2)`
//! under the hood, giving a duplex byte stream between a parent and a
//! freshly forked child without the asymmetry of two one-way pipes.
//! Messages are framed with a 4-byte little-endian length prefix
//! followed by a bincode-encoded [`Message`].

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::Connection;
use crate::message::Message;

/// Maximum accepted frame length. Guards against a corrupted length
/// prefix causing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One end of a duplex pipe connecting the event loop to exactly one
/// local worker process.
pub struct Pipe {
    stream: UnixStream,
}

impl Pipe {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Create a connected pair, one end for the event loop and one for
    /// the worker it is about to fork.
    pub fn pair() -> io::Result<(Pipe, Pipe)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Pipe::new(a), Pipe::new(b)))
    }

    /// Apply a bounded read timeout, used by the local manager's
    /// multiplexed wait.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn try_clone(&self) -> io::Result<Pipe> {
        Ok(Pipe::new(self.stream.try_clone()?))
    }

    /// Exposed so the local manager can register this end with an
    /// `mio::Poll` to multiplex reads across every live worker.
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(&self.stream)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
            return Err(Error::Config(format!(
                "message of {} bytes exceeds the {}-byte frame limit",
                bytes.len(),
                MAX_FRAME_BYTES
            )));
        }
        let len = (bytes.len() as u32).to_le_bytes();
        self.stream.write_all(&len).map_err(map_io_err)?;
        self.stream.write_all(bytes).map_err(map_io_err)?;
        self.stream.flush().map_err(map_io_err)
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        read_exact_or_eof(&mut self.stream, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(Error::Config(format!(
                "peer announced a {len}-byte frame, exceeding the {MAX_FRAME_BYTES}-byte limit"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).map_err(map_io_err)?;
        Ok(payload)
    }
}

/// Like `Read::read_exact`, but a clean EOF on the very first byte is
/// reported as [`Error::Closed`] rather than an I/O error — this is how
/// the local manager learns a worker exited without posting a closing
/// message.
fn read_exact_or_eof(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Err(Error::Timeout("pipe read".to_string()))
            }
            Err(e) => return Err(map_io_err(e)),
        }
    }
    Ok(())
}

fn map_io_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::Closed,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            Error::Timeout("pipe write/read".to_string())
        }
        other => Error::Process(format!("pipe I/O error: {other}")),
    }
}

impl Connection for Pipe {
    fn get(&mut self) -> Result<Message> {
        let bytes = self.read_frame()?;
        Message::from_bytes(&bytes)
    }

    fn put(&mut self, message: Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.write_frame(&bytes)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TrialId;

    #[test]
    fn round_trips_a_message_over_a_real_socketpair() {
        let (mut a, mut b) = Pipe::pair().unwrap();
        a.put(Message::report(TrialId(9), 3.5, 2)).unwrap();
        let received = b.get().unwrap();
        match received {
            Message::Report { header, value, step } => {
                assert_eq!(header.trial_id, TrialId(9));
                assert_eq!(value, 3.5);
                assert_eq!(step, 2);
            }
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn closing_the_peer_surfaces_as_closed_error() {
        let (mut a, b) = Pipe::pair().unwrap();
        drop(b);
        match a.get() {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn read_timeout_surfaces_as_timeout_error() {
        let (mut a, _b) = Pipe::pair().unwrap();
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        match a.get() {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
