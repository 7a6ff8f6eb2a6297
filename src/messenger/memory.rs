//! An in-process [`Transport`].

use std::{collections::HashMap, sync::Arc};

use futures::{stream, StreamExt};
use tokio::sync::{broadcast, Mutex};

use super::{Inbox, Transport, TransportResult};

const CAPACITY: usize = 1024;

/// A transport connecting the messengers of a single process.
///
/// Clones share the same topics.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()> {
        // a message without subscribers is dropped, like on a real bus
        let _ = self.sender(topic).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> TransportResult<Inbox> {
        let mut inboxes = Vec::with_capacity(topics.len());
        for topic in topics {
            let receiver = self.sender(topic).await.subscribe();
            let inbox = stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("inbox lagging behind, {} messages skipped", skipped)
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            inboxes.push(inbox.boxed());
        }
        Ok(stream::select_all(inboxes).boxed())
    }
}
