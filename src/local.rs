//! In-process transport between the pipeline components.
//!
//! Each hop is a [`LocalAdapter`] holding the named endpoints of the next
//! component. A send marshals the packet once, calls every target endpoint
//! with its own oneshot-backed [`AckNacker`] and combines the answers:
//!
//! - more than one answer carrying a packet is `Behavioural`;
//! - one answer carrying a packet wins, returned marshalled;
//! - any other success yields `None`;
//! - with no success, `NotFound` if every target said so, otherwise the
//!   first other failure.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use broker::Broker;
use futures::future::join_all;
use handler::Handler;
use lw_protocol::{
    AckNacker, Adapter, BoxFuture, Error, OneshotAckNacker, Packet, Recipient, Registration,
    Result, Subscriber, marshal,
};
use router::Router;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Something a [`LocalAdapter`] can deliver marshalled packets to.
pub trait Endpoint: Send + Sync {
    fn handle<'a>(&'a self, data: &'a [u8], an: &'a dyn AckNacker) -> BoxFuture<'a, Result<()>>;
}

pub struct BrokerEndpoint {
    broker: Arc<Broker>,
    up: Arc<dyn Adapter>,
}

impl BrokerEndpoint {
    pub fn new(broker: Arc<Broker>, up: Arc<dyn Adapter>) -> Self {
        Self { broker, up }
    }
}

impl Endpoint for BrokerEndpoint {
    fn handle<'a>(&'a self, data: &'a [u8], an: &'a dyn AckNacker) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.broker.handle_up(data, an, self.up.as_ref()))
    }
}

pub struct HandlerEndpoint {
    handler: Arc<Handler>,
    up: Arc<dyn Adapter>,
}

impl HandlerEndpoint {
    pub fn new(handler: Arc<Handler>, up: Arc<dyn Adapter>) -> Self {
        Self { handler, up }
    }
}

impl Endpoint for HandlerEndpoint {
    fn handle<'a>(&'a self, data: &'a [u8], an: &'a dyn AckNacker) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.handler.handle_up(data, an, self.up.clone()))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LocalAdapter {
    peers: Arc<RwLock<BTreeMap<Recipient, Arc<dyn Endpoint>>>>,
    timeout: Duration,
}

impl LocalAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: Arc::new(RwLock::new(BTreeMap::new())),
            timeout,
        }
    }

    pub fn add_peer(&self, name: Recipient, endpoint: Arc<dyn Endpoint>) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(name, endpoint);
        }
    }

    fn targets(&self, recipients: &[Recipient]) -> Result<Vec<(Recipient, Arc<dyn Endpoint>)>> {
        let peers = self
            .peers
            .read()
            .map_err(|_| Error::operational("peer table poisoned"))?;
        let targets: Vec<_> = if recipients.is_empty() {
            peers.iter().map(|(r, e)| (r.clone(), e.clone())).collect()
        } else {
            recipients
                .iter()
                .filter_map(|r| peers.get(r).map(|e| (r.clone(), e.clone())))
                .collect()
        };
        if targets.is_empty() {
            return Err(Error::not_found("no reachable recipient"));
        }
        Ok(targets)
    }

    async fn call(&self, endpoint: &dyn Endpoint, data: &[u8]) -> Result<Option<Packet>> {
        let (an, rx) = OneshotAckNacker::pair();
        if tokio::time::timeout(self.timeout, endpoint.handle(data, &an))
            .await
            .is_err()
        {
            return Err(Error::operational("connection lost: no answer in time"));
        }
        rx.wait(self.timeout).await
    }
}

impl Adapter for LocalAdapter {
    fn send<'a>(
        &'a self,
        packet: &'a Packet,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let data = marshal(packet)?;
            let targets = self.targets(recipients)?;
            let data = &data;
            let calls = targets.iter().map(|(name, endpoint)| async move {
                let outcome = self.call(endpoint.as_ref(), data).await;
                if let Err(e) = &outcome {
                    debug!(recipient = %name, kind = ?e.kind, error = %e, "peer refused packet");
                }
                outcome
            });
            let outcomes = join_all(calls).await;
            combine(outcomes)
        })
    }

    fn get_recipient(&self, raw: &[u8]) -> Result<Recipient> {
        Ok(Recipient(raw.to_vec()))
    }
}

fn combine(outcomes: Vec<Result<Option<Packet>>>) -> Result<Option<Vec<u8>>> {
    let mut answers = Vec::new();
    let mut succeeded = false;
    let mut failure: Option<Error> = None;
    let mut all_not_found = true;

    for outcome in outcomes {
        match outcome {
            Ok(Some(packet)) => answers.push(packet),
            Ok(None) => succeeded = true,
            Err(e) => {
                if !e.is_not_found() {
                    all_not_found = false;
                    failure.get_or_insert(e);
                } else if failure.is_none() && all_not_found {
                    failure = Some(e);
                }
            }
        }
    }

    match answers.len() {
        0 if succeeded => Ok(None),
        0 => {
            let err = failure.unwrap_or_else(|| Error::not_found("no recipient answered"));
            if all_not_found {
                Err(Error::not_found(err.message))
            } else {
                Err(err)
            }
        }
        1 => {
            let packet = answers.remove(0);
            marshal(&packet).map(Some)
        }
        n => {
            warn!(answers = n, "several peers answered the same packet");
            Err(Error::behavioural("received too many positive answers"))
        }
    }
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// Subscribes Handler registrations at the Broker, and routes registered
/// device addresses to that Broker at the Router.
pub struct LocalSubscriber {
    broker: Arc<Broker>,
    broker_name: Recipient,
    router: Option<Arc<Router>>,
    timeout: Duration,
}

impl LocalSubscriber {
    pub fn new(
        broker: Arc<Broker>,
        broker_name: Recipient,
        router: Option<Arc<Router>>,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            broker_name,
            router,
            timeout,
        }
    }
}

impl Subscriber for LocalSubscriber {
    fn subscribe<'a>(&'a self, registration: Registration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let route = match &registration {
                Registration::Broker { dev_addr, .. } => Some(dev_addr.to_eui()),
                _ => None,
            };

            let (an, rx) = OneshotAckNacker::pair();
            let _ = self.broker.register(registration, &an).await;
            rx.wait(self.timeout).await?;

            if let (Some(dev_eui), Some(router)) = (route, &self.router) {
                let (an, rx) = OneshotAckNacker::pair();
                let _ = router
                    .register(
                        Registration::Router {
                            dev_eui,
                            recipient: self.broker_name.clone(),
                        },
                        &an,
                    )
                    .await;
                rx.wait(self.timeout).await?;
            }
            Ok(())
        })
    }
}
