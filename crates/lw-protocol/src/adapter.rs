//! Contracts between pipeline components and the transport layer.
//!
//! Components never open sockets. They receive raw bytes together with an
//! [`AckNacker`] that must be resolved exactly once, and they reach the next
//! hop through an [`Adapter`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use crate::errors::{Error, Result};
use crate::packets::Packet;
use crate::registration::{Recipient, Registration};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound side of a component.
pub trait Adapter: Send + Sync {
    /// Sends `packet` to `recipients`, or to every known peer when
    /// `recipients` is empty. Returns the marshalled answer, if any.
    fn send<'a>(
        &'a self,
        packet: &'a Packet,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Turns raw address bytes into a recipient this adapter can reach.
    fn get_recipient(&self, raw: &[u8]) -> Result<Recipient>;
}

/// Inbound side of a request: exactly one of `ack` / `nack` is called.
pub trait AckNacker: Send + Sync {
    fn ack(&self, packet: Option<Packet>) -> Result<()>;
    fn nack(&self, err: Error) -> Result<()>;
}

/// Registers devices and applications at an upstream component.
pub trait Subscriber: Send + Sync {
    fn subscribe<'a>(&'a self, registration: Registration) -> BoxFuture<'a, Result<()>>;
}

// ---------------------------------------------------------------------------
// Exactly-once resolution
// ---------------------------------------------------------------------------

/// Resolves an [`AckNacker`] exactly once.
///
/// Consumed by [`AckGuard::resolve`]; if dropped unresolved (early return,
/// panic, cancelled future), the request is nacked as `Operational`.
pub struct AckGuard<'a> {
    an: &'a dyn AckNacker,
    resolved: bool,
}

impl<'a> AckGuard<'a> {
    pub fn new(an: &'a dyn AckNacker) -> Self {
        Self {
            an,
            resolved: false,
        }
    }

    /// Acks on `Ok`, nacks on `Err`; returns the processing error, or the
    /// transport's ack failure.
    pub fn resolve(mut self, outcome: Result<Option<Packet>>) -> Result<()> {
        self.resolved = true;
        match outcome {
            Ok(packet) => self.an.ack(packet),
            Err(err) => {
                if let Err(nack_err) = self.an.nack(err.clone()) {
                    warn!(error = %nack_err, "unable to nack request");
                }
                Err(err)
            }
        }
    }
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self
                .an
                .nack(Error::operational("request abandoned before completion"));
        }
    }
}

/// Runs `fut` and resolves `an` from its outcome.
pub async fn ensure_ack_nack<F>(an: &dyn AckNacker, fut: F) -> Result<()>
where
    F: Future<Output = Result<Option<Packet>>>,
{
    let guard = AckGuard::new(an);
    guard.resolve(fut.await)
}

// ---------------------------------------------------------------------------
// Oneshot-backed AckNacker
// ---------------------------------------------------------------------------

type Answer = Result<Option<Packet>>;

/// An [`AckNacker`] that hands its resolution to an [`AckReceiver`].
pub struct OneshotAckNacker {
    tx: Mutex<Option<oneshot::Sender<Answer>>>,
}

pub struct AckReceiver {
    rx: oneshot::Receiver<Answer>,
}

impl OneshotAckNacker {
    pub fn pair() -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            AckReceiver { rx },
        )
    }

    fn deliver(&self, answer: Answer) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::operational("ack channel poisoned"))?
            .take()
            .ok_or_else(|| Error::behavioural("request already resolved"))?;
        tx.send(answer)
            .map_err(|_| Error::operational("connection lost"))
    }
}

impl AckNacker for OneshotAckNacker {
    fn ack(&self, packet: Option<Packet>) -> Result<()> {
        self.deliver(Ok(packet))
    }

    fn nack(&self, err: Error) -> Result<()> {
        self.deliver(Err(err))
    }
}

impl AckReceiver {
    /// Waits at most `timeout` for the request to be resolved.
    pub async fn wait(self, timeout: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Err(Error::operational("connection lost")),
            Err(_) => Err(Error::operational("connection lost: no answer in time")),
        }
    }
}
