//! Persistence of messages and parts, with change notification.

use crate::bus::{Bus, BusEvent};
use crate::error::{Result, SessionError};
use crate::storage::{SharedStorage, StorageExt};

use super::{filter_compacted, MessageInfo, MessageWithParts, Part, ToolState};

const MESSAGE: &str = "message";
const PART: &str = "part";

/// Message service: the single writer path for message and part records.
///
/// Every write goes to the store first and is then announced on the bus.
#[derive(Clone)]
pub struct Messages {
    storage: SharedStorage,
    bus: Bus,
}

impl Messages {
    pub fn new(storage: SharedStorage, bus: Bus) -> Self {
        Self { storage, bus }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub async fn update_message(&self, info: &MessageInfo) -> Result<()> {
        self.storage
            .write_json(&[MESSAGE, info.session_id(), info.id()], info)
            .await?;
        self.bus.publish(BusEvent::MessageUpdated { info: info.clone() });
        Ok(())
    }

    pub async fn update_part(&self, part: &Part) -> Result<()> {
        self.update_part_delta(part, None).await
    }

    /// Upsert a part, optionally announcing the text appended since the last write.
    ///
    /// Tool parts are checked against the stored state so an illegal
    /// progression (for example `completed -> running`) is never persisted.
    /// Rewriting a completed part with its output pruned is allowed.
    pub async fn update_part_delta(&self, part: &Part, delta: Option<String>) -> Result<()> {
        let keys = [PART, part.message_id(), part.id()];
        if let Part::Tool(next) = part {
            if let Some(Part::Tool(current)) = self.storage.read_json::<Part>(&keys).await? {
                let pruned = matches!(current.state, ToolState::Completed { .. }) && next.state.is_compacted();
                if !pruned && !current.state.can_transition_to(&next.state) {
                    return Err(SessionError::InvalidState(format!(
                        "tool part {} cannot move from {} to {}",
                        part.id(),
                        current.state.status(),
                        next.state.status()
                    )));
                }
            }
        }
        self.storage.write_json(&keys, part).await?;
        self.bus.publish(BusEvent::PartUpdated {
            part: part.clone(),
            delta,
        });
        Ok(())
    }

    pub async fn remove_part(&self, session_id: &str, message_id: &str, part_id: &str) -> Result<()> {
        self.storage.remove(&[PART, message_id, part_id]).await?;
        self.bus.publish(BusEvent::PartRemoved {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            part_id: part_id.to_string(),
        });
        Ok(())
    }

    /// Remove a message together with all of its parts.
    pub async fn remove_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        for part_id in self.storage.list(&[PART, message_id]).await? {
            self.remove_part(session_id, message_id, &part_id).await?;
        }
        self.storage.remove(&[MESSAGE, session_id, message_id]).await?;
        self.bus.publish(BusEvent::MessageRemoved {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    pub async fn info(&self, session_id: &str, message_id: &str) -> Result<Option<MessageInfo>> {
        self.storage
            .read_json(&[MESSAGE, session_id, message_id])
            .await
    }

    /// Parts of a message in ascending id order.
    pub async fn parts(&self, message_id: &str) -> Result<Vec<Part>> {
        let mut parts = Vec::new();
        for part_id in self.storage.list(&[PART, message_id]).await? {
            if let Some(part) = self.storage.read_json(&[PART, message_id, &part_id]).await? {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    pub async fn get(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts> {
        let info = self
            .info(session_id, message_id)
            .await?
            .ok_or_else(|| SessionError::not_found("message", message_id))?;
        let parts = self.parts(message_id).await?;
        Ok(MessageWithParts { info, parts })
    }

    /// Full history of a session, oldest first.
    pub async fn list(&self, session_id: &str) -> Result<Vec<MessageWithParts>> {
        let mut messages = Vec::new();
        for message_id in self.storage.list(&[MESSAGE, session_id]).await? {
            let Some(info) = self.info(session_id, &message_id).await? else {
                continue;
            };
            let parts = self.parts(&message_id).await?;
            messages.push(MessageWithParts { info, parts });
        }
        Ok(messages)
    }

    /// History as the model should see it: everything before a completed
    /// compaction is dropped.
    pub async fn filtered(&self, session_id: &str) -> Result<Vec<MessageWithParts>> {
        Ok(filter_compacted(self.list(session_id).await?))
    }
}
