use std::collections::VecDeque;
use std::sync::Mutex;

use lw_protocol::{
    AckNacker, Adapter, BoxFuture, Error, Packet, Recipient, Registration, Result, Subscriber,
};

// ---------------------------------------------------------------------------
// AckNacker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Ack(Option<Packet>),
    Nack(Error),
}

/// Records every ack / nack it receives.
#[derive(Default)]
pub struct RecordingAckNacker {
    outcomes: Mutex<Vec<AckOutcome>>,
}

impl RecordingAckNacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<AckOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// The single resolution of the request. Panics unless there is
    /// exactly one.
    pub fn single(&self) -> AckOutcome {
        let outcomes = self.outcomes();
        assert_eq!(outcomes.len(), 1, "expected exactly one ack/nack, got {outcomes:?}");
        outcomes.into_iter().next().unwrap()
    }

    pub fn acked(&self) -> Option<Packet> {
        match self.single() {
            AckOutcome::Ack(p) => p,
            AckOutcome::Nack(e) => panic!("expected ack, got nack: {e}"),
        }
    }

    pub fn nacked(&self) -> Error {
        match self.single() {
            AckOutcome::Nack(e) => e,
            AckOutcome::Ack(p) => panic!("expected nack, got ack: {p:?}"),
        }
    }
}

impl AckNacker for RecordingAckNacker {
    fn ack(&self, packet: Option<Packet>) -> Result<()> {
        self.outcomes.lock().unwrap().push(AckOutcome::Ack(packet));
        Ok(())
    }

    fn nack(&self, err: Error) -> Result<()> {
        self.outcomes.lock().unwrap().push(AckOutcome::Nack(err));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SentPacket {
    pub packet: Packet,
    pub recipients: Vec<Recipient>,
}

type Responder = Box<dyn Fn(&Packet, &[Recipient]) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// Adapter answering from a script: queued responses first, then the
/// responder (if any), then `Ok(None)`.
#[derive(Default)]
pub struct MockAdapter {
    script: Mutex<VecDeque<Result<Option<Vec<u8>>>>>,
    responder: Option<Responder>,
    sent: Mutex<Vec<SentPacket>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(f: F) -> Self
    where
        F: Fn(&Packet, &[Recipient]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(f)),
            ..Self::default()
        }
    }

    pub fn push_response(&self, response: Result<Option<Vec<u8>>>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().unwrap().clone()
    }
}

impl Adapter for MockAdapter {
    fn send<'a>(
        &'a self,
        packet: &'a Packet,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(SentPacket {
                packet: packet.clone(),
                recipients: recipients.to_vec(),
            });
            if let Some(scripted) = self.script.lock().unwrap().pop_front() {
                return scripted;
            }
            match &self.responder {
                Some(f) => f(packet, recipients),
                None => Ok(None),
            }
        })
    }

    fn get_recipient(&self, raw: &[u8]) -> Result<Recipient> {
        Ok(Recipient(raw.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockSubscriber {
    registrations: Mutex<Vec<Registration>>,
    failure: Option<Error>,
}

impl MockSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: Error) -> Self {
        Self {
            failure: Some(err),
            ..Self::default()
        }
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }
}

impl Subscriber for MockSubscriber {
    fn subscribe<'a>(&'a self, registration: Registration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            self.registrations.lock().unwrap().push(registration);
            Ok(())
        })
    }
}
