//! Requests from client threads to the handler thread.
//!
//! Each request carries its own oneshot reply. A client blocks on the reply
//! after queueing; the handler answers every request it dequeues, and a reply
//! dropped unanswered (the handler exited between queueing and draining)
//! reads as "shutting down".

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};

use faultline_error::{FaultError, Result};

use crate::config::ObjectConfig;
use crate::sys::Doorbell;

/// Identity of an object within its instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Address range reserved for a newly allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub base: usize,
    pub true_size: usize,
}

pub(crate) enum Request {
    Allocate {
        id: ObjectId,
        config: ObjectConfig,
        reply: Reply<Result<Allocation>>,
    },
    Free {
        id: ObjectId,
        reply: Reply<Result<()>>,
    },
    Reset {
        id: ObjectId,
        reply: Reply<Result<()>>,
    },
    Shutdown,
}

impl Request {
    /// Answer a request that will never be serviced because the handler is
    /// going away. Frees succeed: the range is unmapped wholesale anyway.
    pub(crate) fn refuse(self) {
        match self {
            Self::Allocate { reply, .. } => reply.send(Err(FaultError::ShuttingDown)),
            Self::Reset { reply, .. } => reply.send(Err(FaultError::ShuttingDown)),
            Self::Free { reply, .. } => reply.send(Ok(())),
            Self::Shutdown => {}
        }
    }
}

/// Sending half of a oneshot reply.
pub(crate) struct Reply<T>(SyncSender<T>);

/// Receiving half of a oneshot reply.
pub(crate) struct Pending<T>(Receiver<T>);

pub(crate) fn oneshot<T>() -> (Reply<T>, Pending<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Reply(tx), Pending(rx))
}

impl<T> Reply<T> {
    /// Deliver the answer. A client that stopped waiting is not an error.
    pub(crate) fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

impl<T> Pending<T> {
    /// Block until answered; `None` if the reply was dropped.
    pub(crate) fn wait(self) -> Option<T> {
        self.0.recv().ok()
    }
}

/// Client end of the control channel, shared by an instance and its objects.
pub(crate) struct ControlChannel {
    tx: Sender<Request>,
    doorbell: Arc<Doorbell>,
}

/// Handler end of the control channel.
pub(crate) struct ControlInbox {
    rx: Receiver<Request>,
    doorbell: Arc<Doorbell>,
}

pub(crate) fn control_channel() -> Result<(ControlChannel, ControlInbox)> {
    let doorbell = Arc::new(Doorbell::new()?);
    let (tx, rx) = mpsc::channel();
    Ok((
        ControlChannel {
            tx,
            doorbell: Arc::clone(&doorbell),
        },
        ControlInbox { rx, doorbell },
    ))
}

impl ControlChannel {
    /// Queue `request` and wake the handler.
    ///
    /// Fails with [`FaultError::ShuttingDown`] once the handler has dropped
    /// its inbox.
    pub(crate) fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).map_err(|_| FaultError::ShuttingDown)?;
        self.doorbell.ring()
    }

    /// Send a request built around a fresh reply and wait for the answer.
    pub(crate) fn call<T>(
        &self,
        build: impl FnOnce(Reply<Result<T>>) -> Request,
        on_dropped: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let (reply, pending) = oneshot();
        self.send(build(reply))?;
        pending.wait().unwrap_or_else(on_dropped)
    }
}

impl ControlInbox {
    pub(crate) fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// Next queued request, if any.
    pub(crate) fn try_next(&self) -> Option<Request> {
        match self.rx.try_recv() {
            Ok(req) => Some(req),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trip() {
        let (chan, inbox) = control_channel().unwrap();
        let handler = std::thread::spawn(move || {
            loop {
                if inbox.doorbell().drain().unwrap() {
                    break;
                }
                std::thread::yield_now();
            }
            match inbox.try_next() {
                Some(Request::Free { id, reply }) => {
                    assert_eq!(id, ObjectId(7));
                    reply.send(Ok(()));
                }
                _ => panic!("expected a free request"),
            }
        });
        let res = chan.call(
            |reply| Request::Free {
                id: ObjectId(7),
                reply,
            },
            || Err(FaultError::ShuttingDown),
        );
        assert!(res.is_ok());
        handler.join().unwrap();
    }

    #[test]
    fn dropped_reply_uses_fallback() {
        let (chan, inbox) = control_channel().unwrap();
        let res: Result<()> = {
            let (reply, pending) = oneshot::<Result<()>>();
            chan.send(Request::Reset {
                id: ObjectId(1),
                reply,
            })
            .unwrap();
            drop(inbox);
            pending.wait().unwrap_or(Err(FaultError::ShuttingDown))
        };
        assert!(matches!(res, Err(FaultError::ShuttingDown)));
    }

    #[test]
    fn send_after_inbox_dropped_fails() {
        let (chan, inbox) = control_channel().unwrap();
        drop(inbox);
        assert!(matches!(
            chan.send(Request::Shutdown),
            Err(FaultError::ShuttingDown)
        ));
    }

    #[test]
    fn refuse_answers_by_kind() {
        let (reply, pending) = oneshot::<Result<()>>();
        Request::Free {
            id: ObjectId(1),
            reply,
        }
        .refuse();
        assert!(matches!(pending.wait(), Some(Ok(()))));

        let (reply, pending) = oneshot::<Result<()>>();
        Request::Reset {
            id: ObjectId(1),
            reply,
        }
        .refuse();
        assert!(matches!(pending.wait(), Some(Err(FaultError::ShuttingDown))));
    }
}
