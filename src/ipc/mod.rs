//! # IPC Primitives
//!
//! This module provides the transport abstraction connecting one worker
//! to the main process's event loop: `get()` blocks for the next message
//! (or times out), `put()` publishes one, `close()` releases local
//! handles. Two backends implement it — a bidirectional OS pipe for local
//! worker processes (`pipe`), and a public/private named-queue pair for
//! cluster workers (`queue`) — but both serialize the same `Message`
//! wire format, so the event loop and the remote trial proxy never need
//! to know which one is in play.
//!
//! ## Suspension points
//!
//! `get()` is the event loop's and the worker's only blocking point.
//! Every implementation must also observe a
//! [`crate::cancellation::CancellationToken`] while blocked, so a
//! cooperative interrupt can unwind a worker waiting on a response.

pub mod pipe;
pub mod queue;

pub use pipe::Pipe;
pub use queue::Queue;

use crate::error::Result;
use crate::message::Message;

/// A single end of a bidirectional message channel between the event loop
/// and one worker.
///
/// Implementations are not required to be `Sync`; each connection is
/// owned by exactly one side at a time (the manager on the main-process
/// end, the `RemoteTrial` on the worker end) — every trial gets its own
/// private channel, never shared with another trial.
pub trait Connection: Send {
    /// Block until the next message is available, or return
    /// [`crate::error::Error::Timeout`] / [`crate::error::Error::Closed`].
    fn get(&mut self) -> Result<Message>;

    /// Publish a message on the send side.
    fn put(&mut self, message: Message) -> Result<()>;

    /// Release local handles. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TrialId;

    struct FakeConnection {
        inbox: std::collections::VecDeque<Message>,
    }

    impl Connection for FakeConnection {
        fn get(&mut self) -> Result<Message> {
            self.inbox.pop_front().ok_or(crate::error::Error::Closed)
        }
        fn put(&mut self, message: Message) -> Result<()> {
            self.inbox.push_back(message);
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[test]
    fn fake_connection_round_trips_fifo() {
        let mut conn = FakeConnection { inbox: Default::default() };
        conn.put(Message::report(TrialId(1), 1.0, 0)).unwrap();
        conn.put(Message::report(TrialId(1), 2.0, 1)).unwrap();
        let first = conn.get().unwrap();
        match first {
            Message::Report { step, .. } => assert_eq!(step, 0),
            _ => panic!("unexpected message"),
        }
    }
}
