//! Queue for responses produced outside the request/response batch:
//! subscription pushes, list stream updates, and invoke handler rows.
//!
//! The connection drains it while connected.  Every entry is stamped with
//! the connection session it was queued under; rids and sids belong to
//! one broker session, so entries left over from an earlier session are
//! discarded on drain.  Entries queued before the first connection carry
//! session 0 and are flushed when it opens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dslink_protocol::Response;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug)]
struct Queued {
    session: u64,
    response: Response,
}

#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Queued>,
    session: Arc<AtomicU64>,
    pinned: Option<u64>,
}

impl Outbox {
    pub fn channel() -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(AtomicU64::new(0));
        (
            Outbox {
                tx,
                session: session.clone(),
                pinned: None,
            },
            OutboxReceiver { rx, session },
        )
    }

    /// An outbox whose receiver is already gone.  Pushes are dropped.
    pub fn detached() -> Outbox {
        Self::channel().0
    }

    /// A handle that keeps stamping the current session after the next
    /// one begins.  Invoke streams push through one of these.
    pub fn pinned(&self) -> Outbox {
        Outbox {
            pinned: Some(self.session()),
            ..self.clone()
        }
    }

    pub fn push(&self, response: Response) {
        let queued = Queued {
            session: self.pinned.unwrap_or_else(|| self.session()),
            response,
        };
        if self.tx.send(queued).is_err() {
            tracing::trace!("outbox receiver dropped, discarding response");
        }
    }

    /// Start a new connection session.  Entries queued under earlier
    /// sessions will no longer be delivered.
    pub fn begin_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }
}

/// Receiving half of an [`Outbox`].
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
    session: Arc<AtomicU64>,
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<Response> {
        loop {
            let queued = self.rx.recv().await?;
            if let Some(response) = self.admit(queued) {
                return Some(response);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Response, TryRecvError> {
        loop {
            let queued = self.rx.try_recv()?;
            if let Some(response) = self.admit(queued) {
                return Ok(response);
            }
        }
    }

    fn admit(&self, queued: Queued) -> Option<Response> {
        let current = self.session.load(Ordering::SeqCst);
        if queued.session == 0 || queued.session == current {
            return Some(queued.response);
        }
        tracing::trace!(
            rid = queued.response.rid,
            queued = queued.session,
            current,
            "stale outbox entry dropped"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dslink_protocol::Variant;

    #[test]
    fn entries_from_an_ended_session_are_dropped() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.push(Response::closed(1));
        assert_eq!(outbox.begin_session(), 1);
        outbox.push(Response::closed(2));
        outbox.push(Response::subscription_updates(vec![Variant::Int(5)]));
        outbox.begin_session();
        outbox.push(Response::closed(3));

        assert_eq!(rx.try_recv().unwrap(), Response::closed(1));
        assert_eq!(rx.try_recv().unwrap(), Response::closed(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pinned_handle_outlives_its_session() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.begin_session();
        let invoke = outbox.pinned();
        invoke.push(Response::closed(6));
        assert_eq!(rx.try_recv().unwrap(), Response::closed(6));

        outbox.begin_session();
        invoke.push(Response::closed(7));
        outbox.push(Response::closed(8));
        assert_eq!(rx.try_recv().unwrap(), Response::closed(8));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn current_session_entries_pass() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.begin_session();
        outbox.push(Response::closed(4));
        assert_eq!(rx.try_recv().unwrap(), Response::closed(4));
        assert_eq!(outbox.session(), 1);
    }
}
