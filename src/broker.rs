//! Fan-out router from the ingress stream to subscriber streams.
//!
//! The broker is the sole subscriber of `main`. It consumes in raw mode,
//! routes each frame by its event type through the stream registry, and
//! re-publishes the untouched frame onto every interested stream. The
//! original partition key travels with the frame, so per-key order is
//! preserved across the fan-out.
//!
//! Horizontally scalable: broker instances share the ingress consumer group,
//! splitting partitions while each partition stays in order.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::bus::{
    BusError, EventBus, EventHandler, Incoming, RawBatch, Result, SubscribeOptions, Subscriber,
    MAIN_STREAM,
};
use crate::routing::StreamRegistry;

/// The ingress fan-out router.
pub struct Broker {
    bus: Arc<dyn EventBus>,
    registry: Arc<dyn StreamRegistry>,
}

impl Broker {
    pub fn new(bus: Arc<dyn EventBus>, registry: Arc<dyn StreamRegistry>) -> Self {
        Self { bus, registry }
    }

    /// Subscribe to the ingress stream and start routing.
    pub async fn start(&self) -> Result<Subscriber> {
        let handler = Arc::new(RouteHandler {
            bus: self.bus.clone(),
            registry: self.registry.clone(),
        });

        let subscriber = self
            .bus
            .subscribe(MAIN_STREAM, handler, SubscribeOptions::raw())
            .await?;

        info!(stream = MAIN_STREAM, "Broker started");
        Ok(subscriber)
    }
}

struct RouteHandler {
    bus: Arc<dyn EventBus>,
    registry: Arc<dyn StreamRegistry>,
}

impl EventHandler for RouteHandler {
    fn handle(&self, incoming: Incoming) -> BoxFuture<'static, Result<()>> {
        let bus = self.bus.clone();
        let registry = self.registry.clone();

        Box::pin(async move {
            let raw = match incoming {
                Incoming::Raw(raw) => raw,
                Incoming::Decoded(_) => {
                    return Err(BusError::Handler(
                        "broker requires a raw subscription".to_string(),
                    ));
                }
            };

            // Registry errors bubble out so the subscriber retry loop
            // redelivers the frame.
            let streams = registry
                .find_streams(raw.event_type)
                .await
                .map_err(|e| BusError::Handler(e.to_string()))?;

            if streams.is_empty() {
                debug!(event_type = raw.event_type, "No subscriber streams, dropping event");
                return Ok(());
            }

            let batches = streams
                .into_iter()
                .map(|stream| RawBatch {
                    stream,
                    events: vec![raw.clone()],
                })
                .collect();

            bus.send_raw(batches).await
        })
    }
}
