//! Publish/subscribe plumbing.
//!
//! A [`Messenger`] wraps a [`Transport`]: it stamps outgoing payloads with the headers of the
//! sender, publishes them on the topic of a [`Route`] and delivers the decoded inbound messages to
//! a single [`MessageHandler`].
//!
//! Topics are derived from the exchange name shared by a federation:
//!
//! - `{exchange}.server`: messages for the server;
//! - `{exchange}.clients`: broadcasts of the server to every client;
//! - `{exchange}.client.{client_id}`: messages for a single client.

pub mod memory;
pub mod redis;

use displaydoc::Display;
use futures::{stream::BoxStream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{watch, RwLock},
    time,
};

pub use self::{memory::MemoryTransport, redis::RedisTransport};
use crate::{
    messages::{Message, MessageType, Payload, ProtocolError},
    settings::RetrySettings,
    utils::retry::with_retry,
};

/// The error type of the transports.
pub type TransportError = anyhow::Error;
pub type TransportResult<T> = Result<T, TransportError>;

/// A stream of raw inbound messages.
pub type Inbox = BoxStream<'static, String>;

#[async_trait]
/// A publish/subscribe transport.
pub trait Transport: Send + Sync + 'static {
    /// Publishes a raw message on a topic.
    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()>;

    /// Subscribes to a set of topics.
    ///
    /// # Behavior
    ///
    /// The returned stream ends when the underlying connection is lost.
    async fn subscribe(&self, topics: &[String]) -> TransportResult<Inbox>;
}

#[async_trait]
/// The receiver of the inbound messages of a [`Messenger`].
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

/// The destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// The server.
    Server,
    /// Every client.
    Clients,
    /// A single client.
    Client(String),
}

/// The identity a [`Messenger`] puts in the headers of its messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub session_id: String,
    pub client_id: String,
}

impl Identity {
    pub fn new(session_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: client_id.into(),
        }
    }
}

/// Errors of a [`Messenger`].
#[derive(Debug, Display, Error)]
pub enum MessengerError {
    /// Failed to encode message: {0}.
    Protocol(#[from] ProtocolError),
    /// Failed to publish a {message_type} message after {attempts} attempts: {error}.
    Publish {
        message_type: MessageType,
        attempts: usize,
        error: TransportError,
    },
    /// Failed to subscribe to {topics} after {attempts} attempts: {error}.
    Subscribe {
        topics: String,
        attempts: usize,
        error: TransportError,
    },
}

/// An active subscription of a [`Messenger`].
pub struct Subscription {
    topics: Vec<String>,
    inbox: Inbox,
}

impl Subscription {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

/// Sends and receives [`Message`]s over a [`Transport`].
pub struct Messenger<T> {
    transport: T,
    exchange: String,
    identity: RwLock<Identity>,
    retry: RetrySettings,
}

impl<T> Messenger<T>
where
    T: Transport,
{
    pub fn new(
        transport: T,
        exchange: impl Into<String>,
        identity: Identity,
        retry: RetrySettings,
    ) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
            identity: RwLock::new(identity),
            retry,
        }
    }

    /// The topic of a route.
    pub fn topic(&self, route: &Route) -> String {
        match route {
            Route::Server => format!("{}.server", self.exchange),
            Route::Clients => format!("{}.clients", self.exchange),
            Route::Client(client_id) => format!("{}.client.{}", self.exchange, client_id),
        }
    }

    pub async fn identity(&self) -> Identity {
        self.identity.read().await.clone()
    }

    /// Replaces the session put in the headers of the next messages.
    pub async fn set_session(&self, session_id: impl Into<String>) {
        self.identity.write().await.session_id = session_id.into();
    }

    /// Sends a payload, retrying failed publications.
    pub async fn send(
        &self,
        route: Route,
        payload: impl Into<Payload>,
    ) -> Result<(), MessengerError> {
        let Identity {
            session_id,
            client_id,
        } = self.identity().await;
        let message = Message::new(session_id, client_id, payload.into());
        let message_type = message.headers.message_type;
        let raw = message.encode()?;
        let topic = self.topic(&route);

        let transport = &self.transport;
        let (raw, topic) = (&raw, &topic);
        let ((), attempts) = with_retry("publish", self.retry, move || {
            transport.publish(topic, raw.clone())
        })
        .await
        .map_err(|exhausted| MessengerError::Publish {
            message_type,
            attempts: exhausted.attempts,
            error: exhausted.error,
        })?;
        trace!(attempts, "sent {} message to {}", message_type, topic);
        Ok(())
    }

    /// Subscribes to the topics of the given routes, retrying failed subscriptions.
    pub async fn subscribe(&self, routes: &[Route]) -> Result<Subscription, MessengerError> {
        let topics: Vec<String> = routes.iter().map(|route| self.topic(route)).collect();
        let inbox = self.subscribe_topics(&topics).await?;
        Ok(Subscription { topics, inbox })
    }

    async fn subscribe_topics(&self, topics: &[String]) -> Result<Inbox, MessengerError> {
        let transport = &self.transport;
        let (inbox, attempts) =
            with_retry("subscribe", self.retry, move || transport.subscribe(topics))
                .await
                .map_err(|exhausted| MessengerError::Subscribe {
                    topics: topics.join(", "),
                    attempts: exhausted.attempts,
                    error: exhausted.error,
                })?;
        debug!(attempts, "subscribed to {}", topics.join(", "));
        Ok(inbox)
    }

    /// Delivers the inbound messages of a subscription to `handler`, one at a time, until
    /// `shutdown` turns `true`.
    ///
    /// Messages which can't be decoded are discarded. A lost subscription is re-established, for
    /// as long as it takes.
    pub async fn dispatch<H>(
        &self,
        subscription: Subscription,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) where
        H: MessageHandler + ?Sized,
    {
        let Subscription { topics, mut inbox } = subscription;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                raw = inbox.next() => match raw {
                    Some(raw) => match Message::decode(&raw) {
                        Ok(message) => handler.handle(message).await,
                        Err(err) => warn!("discarding inbound message: {}", err),
                    },
                    None => {
                        warn!("subscription to {} lost, resubscribing", topics.join(", "));
                        match self.resubscribe(&topics, &mut shutdown).await {
                            Some(renewed) => inbox = renewed,
                            None => break,
                        }
                    }
                },
            }
        }
        debug!("stopped dispatching messages of {}", topics.join(", "));
    }

    /// Subscribes to `topics` until it succeeds, waiting the retry backoff between two rounds of
    /// attempts. Gives up only when `shutdown` turns `true`.
    async fn resubscribe(
        &self,
        topics: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Inbox> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let subscribed = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => return None,
                },
                subscribed = self.subscribe_topics(topics) => subscribed,
            };
            match subscribed {
                Ok(inbox) => return Some(inbox),
                Err(err) => warn!("{} Retrying in {:?}.", err, self.retry.backoff()),
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = time::sleep(self.retry.backoff()) => {}
            }
        }
    }
}
