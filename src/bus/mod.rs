//! Event Bus: publish/subscribe fan-out of state-change notifications.
//!
//! The bus is a side channel. The Message Store stays authoritative, and a
//! lagging subscriber simply misses events.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::MessageError;
use crate::message::{MessageInfo, Part};
use crate::permission::{PermissionReply, PermissionRequest};
use crate::session::SessionInfo;

/// Busy/idle status of a session's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Busy,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum BusEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated { info: SessionInfo },
    #[serde(rename = "session.deleted")]
    SessionDeleted { info: SessionInfo },
    #[serde(rename = "session.status")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    #[serde(rename = "session.error")]
    SessionError {
        session_id: String,
        error: MessageError,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    /// `delta` carries the appended text while a text or reasoning part streams.
    #[serde(rename = "message.part.updated")]
    PartUpdated {
        part: Part,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    #[serde(rename = "message.part.removed")]
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    #[serde(rename = "permission.asked")]
    PermissionAsked { request: PermissionRequest },
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        request_id: String,
        reply: PermissionReply,
    },
}

impl BusEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionUpdated { info } | Self::SessionDeleted { info } => &info.id,
            Self::SessionStatus { session_id, .. }
            | Self::SessionError { session_id, .. }
            | Self::MessageRemoved { session_id, .. }
            | Self::PartRemoved { session_id, .. }
            | Self::PermissionReplied { session_id, .. } => session_id,
            Self::MessageUpdated { info } => info.session_id(),
            Self::PartUpdated { part, .. } => part.session_id(),
            Self::PermissionAsked { request } => &request.session_id,
        }
    }
}

#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream, skipping over lag gaps.
    pub fn stream(&self) -> impl futures::Stream<Item = BusEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(lagged) => {
                    tracing::warn!(error = %lagged, "bus subscriber lagged");
                    None
                }
            }
        })
    }

    /// Invoke `handler` for every event until the returned subscription is
    /// unsubscribed or dropped.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(BusEvent) + Send + Sync + 'static,
    {
        let stream = self.stream();
        let task = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                handler(event);
            }
        });
        Subscription { task: Some(task) }
    }
}

/// Handle returned by [`Bus::subscribe_all`].
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Duration};

    fn removed(id: &str) -> BusEvent {
        BusEvent::MessageRemoved {
            session_id: "ses_1".to_string(),
            message_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_receive_event() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(removed("msg_1")), 1);

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("timeout")
            .expect("recv");
        assert!(matches!(received, BusEvent::MessageRemoved { ref message_id, .. } if message_id == "msg_1"));
        assert_eq!(received.session_id(), "ses_1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = Bus::new(8);
        assert_eq!(bus.publish(removed("msg_1")), 0);
    }

    #[tokio::test]
    async fn subscribe_all_until_unsubscribed() {
        let bus = Bus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = bus.subscribe_all(move |event| {
            if let BusEvent::MessageRemoved { message_id, .. } = event {
                sink.lock().unwrap().push(message_id);
            }
        });
        tokio::task::yield_now().await;

        bus.publish(removed("msg_1"));
        timeout(Duration::from_millis(200), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handler ran");

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        bus.publish(removed("msg_2"));
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), vec!["msg_1".to_string()]);
    }

    #[test]
    fn events_serialize_with_dotted_type() {
        let value = serde_json::to_value(removed("msg_1")).unwrap();
        assert_eq!(value["type"], "message.removed");
        assert_eq!(value["properties"]["message_id"], "msg_1");
    }
}
