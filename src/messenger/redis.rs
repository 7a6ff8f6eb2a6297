//! A Redis pub/sub [`Transport`].

use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, IntoConnectionInfo, RedisError};

use super::{Inbox, Transport, TransportResult};

/// A transport over Redis pub/sub.
///
/// Publications go through a [`redis::aio::ConnectionManager`] that automatically reconnects if
/// the connection is dropped. Every subscription opens a dedicated connection; its inbox ends when
/// that connection is lost.
#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisTransport {
    /// Creates a new Redis transport.
    ///
    /// `url` to which Redis instance the transport should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    pub async fn new<T: IntoConnectionInfo>(url: T) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_tokio_connection_manager().await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()> {
        let mut connection = self.publisher.clone();
        // https://redis.io/commands/publish
        // > Integer reply: the number of clients that received the message.
        let receivers: u64 = connection.publish(topic, payload).await?;
        trace!("published on {} to {} receivers", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> TransportResult<Inbox> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }
        let inbox = pubsub
            .into_on_message()
            .filter_map(|message| async move {
                match message.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        warn!(
                            "discarding non-text message on {}: {}",
                            message.get_channel_name(),
                            err
                        );
                        None
                    }
                }
            });
        Ok(inbox.boxed())
    }
}
