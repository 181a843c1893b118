//! Application side of the Handler: receives decrypted uplinks.

use lw_protocol::{AckNacker, APacket, BoxFuture, Error, Packet, Result, unmarshal};
use tokio::sync::broadcast;
use tracing::info;

use crate::local::Endpoint;

const FEED_CAPACITY: usize = 256;

/// Logs every application uplink and republishes it on a broadcast feed.
/// Uplinks are acknowledged without an answer; downlinks reach the Handler
/// through its own queue.
pub struct ApplicationSink {
    feed: broadcast::Sender<APacket>,
}

impl ApplicationSink {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { feed }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<APacket> {
        self.feed.subscribe()
    }

    fn deliver(&self, data: &[u8]) -> Result<()> {
        let apacket = match unmarshal(data)? {
            Packet::A(p) => p,
            other => {
                return Err(Error::structural(format!(
                    "application cannot handle {}",
                    other.kind()
                )));
            }
        };
        info!(
            app_eui = %apacket.app_eui,
            dev_eui = %apacket.dev_eui,
            payload = %hex::encode(&apacket.payload),
            gateways = apacket.metadata.len(),
            "application uplink"
        );
        // No subscriber is fine.
        let _ = self.feed.send(apacket);
        Ok(())
    }
}

impl Default for ApplicationSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for ApplicationSink {
    fn handle<'a>(&'a self, data: &'a [u8], an: &'a dyn AckNacker) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.deliver(data) {
                Ok(()) => an.ack(None),
                Err(e) => an.nack(e),
            }
        })
    }
}
