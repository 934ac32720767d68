//! Turns inbound delay requests into store entries.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::core::broker::{InboundMessage, MessageId, Subscription};
use crate::core::error::IngressError;
use crate::core::message::{current_unix_secs, decode_message, encode_message};
use crate::core::shutdown::ShutdownSignal;
use crate::core::store::DelayStore;
use crate::metrics;

pub struct IngressAdapter {
    store: Arc<dyn DelayStore>,
    max_concurrency: usize,
}

impl IngressAdapter {
    pub fn new(store: Arc<dyn DelayStore>, max_concurrency: usize) -> Self {
        Self {
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Handles one request as of `now` (unix seconds) and returns the score
    /// it was stored under.
    ///
    /// The inbound message is finished whatever the outcome: a request that
    /// failed here would fail the same way on redelivery.
    pub async fn handle_at(&self, msg: InboundMessage, now: i64) -> Result<i64, IngressError> {
        let result = self.ingest(&msg.id, &msg.body, now).await;

        match &result {
            Ok(_) => metrics::inc_ingress_accepted(1),
            Err(IngressError::Store(e)) => {
                metrics::inc_ingress_store_errors(1);
                error!(target: "nsqdelay::ingress", id = %msg.id, error = %e, "failed to store delay request");
            }
            Err(e) => {
                metrics::inc_ingress_rejected(1);
                warn!(target: "nsqdelay::ingress", id = %msg.id, error = %e, "delay request rejected");
            }
        }

        let id = msg.id.clone();
        if let Err(e) = msg.finish().await {
            warn!(target: "nsqdelay::ingress", %id, error = %e, "FIN failed");
        }
        result
    }

    pub async fn handle(&self, msg: InboundMessage) -> Result<i64, IngressError> {
        self.handle_at(msg, current_unix_secs()).await
    }

    async fn ingest(&self, id: &MessageId, raw: &[u8], now: i64) -> Result<i64, IngressError> {
        let mut request = decode_message(raw)?;
        request.validate()?;
        request.id = id.0.clone();
        let execute_at = request.execute_at(now)?;

        let member = encode_message(&request)?;
        self.store.insert(&member, execute_at).await?;
        info!(
            target: "nsqdelay::ingress",
            id = %request.id,
            topic = %request.topic,
            send_in = request.send_in,
            execute_at,
            "accepted delay request"
        );
        Ok(execute_at)
    }

    /// Handles messages from `subscription`, up to `max_concurrency` at a
    /// time, until shutdown or the subscription ends. Requests already
    /// being handled are completed; undelivered ones are left to the
    /// broker.
    pub async fn run(&self, subscription: Subscription, mut shutdown: ShutdownSignal) {
        info!(target: "nsqdelay::ingress", max_concurrency = self.max_concurrency, "ingress started");

        subscription
            .receiver()
            .stream()
            .take_until(Box::pin(shutdown.recv()))
            .for_each_concurrent(self.max_concurrency, |msg| async move {
                let _ = self.handle(msg).await;
            })
            .await;

        subscription.close();
        info!(target: "nsqdelay::ingress", "ingress stopped");
    }
}
