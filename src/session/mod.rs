//! Sessions: persisted conversation contexts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bus::{Bus, BusEvent};
use crate::error::{Result, SessionError};
use crate::id::{self, Prefix};
use crate::message::{now_ms, MessageInfo, Messages, Part};
use crate::permission::Ruleset;
use crate::storage::{SharedStorage, StorageExt};

const SESSION: &str = "session";
const DEFAULT_TITLE_PREFIX: &str = "New session - ";
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTime {
    pub created: u64,
    pub updated: u64,
    /// Set while a compaction is being generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub directory: String,
    #[serde(default)]
    pub permission: Ruleset,
    pub time: SessionTime,
}

impl SessionInfo {
    pub fn has_default_title(&self) -> bool {
        is_default_title(&self.title)
    }
}

pub fn default_title() -> String {
    format!("{DEFAULT_TITLE_PREFIX}{}", chrono::Utc::now().to_rfc3339())
}

pub fn is_default_title(title: &str) -> bool {
    title.starts_with(DEFAULT_TITLE_PREFIX)
}

/// Derive a short title from the first line of user text.
pub fn title_from_text(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    Some(title)
}

/// Session service. Deleting a session cascades to its children, messages and parts.
#[derive(Clone)]
pub struct Sessions {
    storage: SharedStorage,
    bus: Bus,
    messages: Messages,
}

impl Sessions {
    pub fn new(storage: SharedStorage, bus: Bus) -> Self {
        let messages = Messages::new(storage.clone(), bus.clone());
        Self {
            storage,
            bus,
            messages,
        }
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub async fn create(
        &self,
        parent_id: Option<String>,
        title: Option<String>,
        directory: impl Into<String>,
    ) -> Result<SessionInfo> {
        let now = now_ms();
        let info = SessionInfo {
            id: id::ascending(Prefix::Session),
            parent_id,
            title: title.unwrap_or_else(default_title),
            directory: directory.into(),
            permission: Ruleset::default(),
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
            },
        };
        self.write(&info).await?;
        tracing::debug!(session_id = %info.id, parent_id = ?info.parent_id, "session created");
        Ok(info)
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        self.storage
            .read_json(&[SESSION, session_id])
            .await?
            .ok_or_else(|| SessionError::not_found("session", session_id))
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for id in self.storage.list(&[SESSION]).await? {
            if let Some(info) = self.storage.read_json(&[SESSION, &id]).await? {
                sessions.push(info);
            }
        }
        Ok(sessions)
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<SessionInfo>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|info| info.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Apply `mutate` and persist, bumping the update time.
    pub async fn update<F>(&self, session_id: &str, mutate: F) -> Result<SessionInfo>
    where
        F: FnOnce(&mut SessionInfo) + Send,
    {
        let mut info = self.get(session_id).await?;
        mutate(&mut info);
        info.time.updated = now_ms();
        self.write(&info).await?;
        Ok(info)
    }

    pub async fn touch(&self, session_id: &str) -> Result<SessionInfo> {
        self.update(session_id, |_| {}).await
    }

    pub async fn set_title(&self, session_id: &str, title: impl Into<String>) -> Result<SessionInfo> {
        let title = title.into();
        self.update(session_id, move |info| info.title = title).await
    }

    pub async fn set_permission(&self, session_id: &str, permission: Ruleset) -> Result<SessionInfo> {
        self.update(session_id, move |info| info.permission = permission)
            .await
    }

    pub async fn set_compacting(&self, session_id: &str, compacting: bool) -> Result<SessionInfo> {
        self.update(session_id, move |info| {
            info.time.compacting = compacting.then(now_ms);
        })
        .await
    }

    /// Copy a session's history into a new session. With `up_to`, messages
    /// from that id onward are left out.
    pub async fn fork(&self, session_id: &str, up_to: Option<&str>) -> Result<SessionInfo> {
        let source = self.get(session_id).await?;
        let forked = self
            .create(
                Some(source.id.clone()),
                Some(format!("{} (fork)", source.title)),
                source.directory.clone(),
            )
            .await?;
        let forked = self
            .set_permission(&forked.id, source.permission.clone())
            .await?;

        let mut remapped: HashMap<String, String> = HashMap::new();
        for message in self.messages.list(session_id).await? {
            if up_to.is_some_and(|limit| message.id() >= limit) {
                break;
            }
            let new_id = id::ascending(Prefix::Message);
            remapped.insert(message.id().to_string(), new_id.clone());
            let info = match message.info {
                MessageInfo::User(mut user) => {
                    user.id = new_id.clone();
                    user.session_id = forked.id.clone();
                    MessageInfo::User(user)
                }
                MessageInfo::Assistant(mut assistant) => {
                    assistant.id = new_id.clone();
                    assistant.session_id = forked.id.clone();
                    if let Some(parent) = remapped.get(&assistant.parent_id) {
                        assistant.parent_id = parent.clone();
                    }
                    MessageInfo::Assistant(assistant)
                }
            };
            self.messages.update_message(&info).await?;
            for mut part in message.parts {
                let base = part.base_mut();
                base.id = id::ascending(Prefix::Part);
                base.session_id = forked.id.clone();
                base.message_id = new_id.clone();
                self.messages.update_part(&part).await?;
            }
        }
        tracing::debug!(session_id = %source.id, fork_id = %forked.id, "session forked");
        Ok(forked)
    }

    /// Delete a session, its child sessions and every message and part.
    /// Returns the ids of the deleted sessions, children first.
    pub async fn delete(&self, session_id: &str) -> Result<Vec<String>> {
        let info = self.get(session_id).await?;
        let mut pending = vec![info];
        let mut ordered = Vec::new();
        while let Some(session) = pending.pop() {
            pending.extend(self.children(&session.id).await?);
            ordered.push(session);
        }
        // Children before parents.
        let mut deleted = Vec::with_capacity(ordered.len());
        for session in ordered.into_iter().rev() {
            for message in self.messages.list(&session.id).await? {
                self.messages.remove_message(&session.id, message.id()).await?;
            }
            self.storage.remove(&[SESSION, &session.id]).await?;
            tracing::debug!(session_id = %session.id, "session deleted");
            deleted.push(session.id.clone());
            self.bus.publish(BusEvent::SessionDeleted { info: session });
        }
        Ok(deleted)
    }

    /// First non-synthetic user text in the session, if any.
    pub async fn first_user_text(&self, session_id: &str) -> Result<Option<String>> {
        for message in self.messages.list(session_id).await? {
            if let MessageInfo::User(_) = message.info {
                let text: Vec<&str> = message
                    .parts
                    .iter()
                    .filter_map(Part::as_text)
                    .filter(|part| !part.synthetic && !part.ignored)
                    .map(|part| part.text.as_str())
                    .collect();
                if !text.is_empty() {
                    return Ok(Some(text.join("\n")));
                }
            }
        }
        Ok(None)
    }

    async fn write(&self, info: &SessionInfo) -> Result<()> {
        self.storage.write_json(&[SESSION, &info.id], info).await?;
        self.bus.publish(BusEvent::SessionUpdated { info: info.clone() });
        Ok(())
    }
}
