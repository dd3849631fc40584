//! Scale-out bridge — cross-instance fan-out over a pub/sub broker.
//!
//! ARCHITECTURE
//! ============
//! Every room or account fan-out on this instance is also published to the
//! broker on `{prefix}:room:{id}` or `{prefix}:user:{id}`. Each instance
//! pattern-subscribes to `{prefix}:*` and re-injects what it receives into
//! its own local fan-out, so a client connected to instance B sees messages
//! sent through instance A.
//!
//! DESIGN
//! ======
//! - Publish is fire-and-forget on a spawned task; failures are logged.
//! - Every bridged message carries the publishing instance id. The
//!   subscriber drops its own messages, since local delivery already
//!   happened on the publish path.
//! - Re-injected envelopes are delivered with no exclusion; the excluded
//!   connection only ever lives on the origin instance.
//! - If the broker stream ends the subscriber resubscribes after a delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::services::hub::Hub;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode bridge message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode bridge message: {0}")]
    Decode(serde_json::Error),
    #[error("unrecognised bridge channel: {0}")]
    BadChannel(String),
}

/// Fan-out scope a bridged envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Room(Uuid),
    Account(Uuid),
}

/// One message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

pub type BrokerStream = BoxStream<'static, BrokerMessage>;

/// External publish/subscribe transport.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError>;

    /// Subscribe to every channel matching a glob-style pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream, BridgeError>;
}

#[derive(Serialize, Deserialize)]
struct BridgeMessage {
    origin: Uuid,
    envelope: Envelope,
}

// =============================================================================
// REDIS
// =============================================================================

/// Redis pub/sub broker. Publishing shares one multiplexed connection;
/// each subscription opens its own pub/sub connection.
pub struct RedisBroker {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        use redis::AsyncCommands;

        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream, BridgeError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage { channel: msg.get_channel_name().to_string(), payload }),
                Err(e) => {
                    warn!(error = %e, channel = msg.get_channel_name(), "bridge: non-text payload ignored");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

#[derive(Clone)]
pub struct Bridge {
    broker: Arc<dyn Broker>,
    instance_id: Uuid,
    prefix: Arc<str>,
}

impl Bridge {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, prefix: &str) -> Self {
        Self { broker, instance_id: Uuid::new_v4(), prefix: Arc::from(prefix) }
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn channel_for(&self, target: Target) -> String {
        match target {
            Target::Room(id) => format!("{}:room:{id}", self.prefix),
            Target::Account(id) => format!("{}:user:{id}", self.prefix),
        }
    }

    /// Map a broker channel name back to its fan-out target.
    pub fn parse_channel(&self, channel: &str) -> Result<Target, BridgeError> {
        let bad = || BridgeError::BadChannel(channel.to_string());
        let rest = channel
            .strip_prefix(&*self.prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(bad)?;
        let (scope, id) = rest.split_once(':').ok_or_else(bad)?;
        let id: Uuid = id.parse().map_err(|_| bad())?;
        match scope {
            "room" => Ok(Target::Room(id)),
            "user" => Ok(Target::Account(id)),
            _ => Err(bad()),
        }
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String, BridgeError> {
        let msg = BridgeMessage { origin: self.instance_id, envelope: envelope.clone() };
        serde_json::to_string(&msg).map_err(BridgeError::Encode)
    }

    /// Decode a broker payload. `Ok(None)` means this instance published it.
    pub fn decode(&self, payload: &str) -> Result<Option<Envelope>, BridgeError> {
        let msg: BridgeMessage = serde_json::from_str(payload).map_err(BridgeError::Decode)?;
        if msg.origin == self.instance_id {
            return Ok(None);
        }
        Ok(Some(msg.envelope))
    }

    /// Publish an envelope for other instances. Best-effort, never blocks.
    pub fn publish(&self, target: Target, envelope: &Envelope) {
        let payload = match self.encode(envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "bridge: encode failed");
                return;
            }
        };
        let channel = self.channel_for(target);
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.publish(&channel, payload).await {
                warn!(error = %e, %channel, "bridge: publish failed");
            }
        });
    }

    /// Deliver one broker message into the local hub.
    /// Returns the number of local connections reached.
    pub async fn reinject(&self, hub: &Hub, msg: &BrokerMessage) -> usize {
        let target = match self.parse_channel(&msg.channel) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bridge: dropping message");
                return 0;
            }
        };
        let envelope = match self.decode(&msg.payload) {
            Ok(Some(env)) => env,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, channel = %msg.channel, "bridge: dropping message");
                return 0;
            }
        };
        let delivered = hub.deliver_local(target, &envelope).await;
        debug!(channel = %msg.channel, kind = ?envelope.kind, delivered, "bridge: re-injected");
        delivered
    }
}

// =============================================================================
// SUBSCRIBER
// =============================================================================

/// Spawn the subscribe loop feeding broker traffic into `hub`.
pub fn spawn_subscriber(bridge: Bridge, hub: Hub) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pattern = format!("{}:*", bridge.prefix);
        loop {
            match bridge.broker.psubscribe(&pattern).await {
                Ok(mut stream) => {
                    info!(%pattern, instance_id = %bridge.instance_id, "bridge: subscribed");
                    while let Some(msg) = stream.next().await {
                        bridge.reinject(&hub, &msg).await;
                    }
                    warn!(%pattern, "bridge: subscription stream ended");
                }
                Err(e) => {
                    error!(error = %e, %pattern, "bridge: subscribe failed");
                }
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;
