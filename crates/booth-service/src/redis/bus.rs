//! Redis pub/sub implementation of [`EventBus`].
//!
//! Publishing is a plain `PUBLISH` on the shared channel. A background task
//! holds the `SUBSCRIBE` connection and pumps decoded envelopes into a local
//! broadcast channel that registries subscribe to. When the subscription
//! drops the task reconnects with exponential back-off until cancelled.

use crate::bus::local::LOCAL_BUS_CAPACITY;
use crate::bus::{BusMessage, EventBus};
use crate::errors::BoothError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::Client;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct RedisEventBus {
    publisher: MultiplexedConnection,
    channel: String,
    sender: broadcast::Sender<BusMessage>,
}

async fn open_subscription(client: &Client, channel: &str) -> Result<PubSub, BoothError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BoothError::Bus(format!("Failed to open subscription: {e}")))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| BoothError::Bus(format!("Failed to subscribe: {e}")))?;
    Ok(pubsub)
}

impl RedisEventBus {
    /// Connect the publisher and start the subscriber task.
    ///
    /// The subscription is established before this returns, so nothing
    /// published afterwards is missed.
    ///
    /// # Errors
    ///
    /// `Bus` if Redis is unreachable.
    pub async fn connect(
        redis_url: &str,
        channel: &str,
        cancel_token: CancellationToken,
    ) -> Result<Self, BoothError> {
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "booth.bus", error = %e, "Failed to open Redis client");
            BoothError::Bus(format!("Failed to open Redis client: {e}"))
        })?;

        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "booth.bus", error = %e, "Failed to connect publisher");
                BoothError::Bus(format!("Failed to connect publisher: {e}"))
            })?;

        let pubsub = open_subscription(&client, channel).await?;
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);

        tokio::spawn(run_subscriber(
            client,
            channel.to_string(),
            sender.clone(),
            pubsub,
            cancel_token,
        ));

        info!(target: "booth.bus", channel = %channel, "Event bus connected");

        Ok(Self {
            publisher,
            channel: channel.to_string(),
            sender,
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    #[instrument(skip_all, fields(channel = message.channel()))]
    async fn publish(&self, message: BusMessage) -> Result<(), BoothError> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "booth.bus", error = %e, "Publish failed");
                BoothError::Bus(format!("Publish failed: {e}"))
            })?;
        debug!(target: "booth.bus", receivers, "Published");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

async fn run_subscriber(
    client: Client,
    channel: String,
    sender: broadcast::Sender<BusMessage>,
    initial: PubSub,
    cancel_token: CancellationToken,
) {
    let mut next = Some(initial);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let pubsub = match next.take() {
            Some(pubsub) => pubsub,
            None => match open_subscription(&client, &channel).await {
                Ok(pubsub) => {
                    info!(target: "booth.bus", "Subscription re-established");
                    backoff = INITIAL_BACKOFF;
                    pubsub
                }
                Err(e) => {
                    warn!(
                        target: "booth.bus",
                        error = %e,
                        retry_in_ms = backoff.as_millis(),
                        "Subscription failed, retrying"
                    );
                    tokio::select! {
                        () = cancel_token.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            },
        };

        let stream = pubsub.into_on_message();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "booth.bus", "Subscriber shutting down");
                    return;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!(target: "booth.bus", "Subscription closed, reconnecting");
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(target: "booth.bus", error = %e, "Non-text bus payload dropped");
                            continue;
                        }
                    };
                    match serde_json::from_str::<BusMessage>(&payload) {
                        Ok(message) => {
                            // No local subscribers yet is fine.
                            let _ = sender.send(message);
                        }
                        Err(e) => {
                            warn!(target: "booth.bus", error = %e, "Undecodable bus message dropped");
                        }
                    }
                }
            }
        }
    }
}
