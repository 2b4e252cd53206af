//! Permission Gate: rule evaluation plus serialized user prompts.

pub mod ruleset;

pub use ruleset::{wildcard_match, PermissionAction, PermissionRule, Ruleset};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusEvent};
use crate::controller::Controller;
use crate::error::{Result, SessionError};
use crate::id::{self, Prefix};

/// A question put to the user before a tool runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub permission: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Whether an `always` reply will be remembered for the session.
    pub allow_always: bool,
}

impl PermissionRequest {
    pub fn new(session_id: impl Into<String>, permission: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            id: id::ascending(Prefix::Permission),
            session_id: session_id.into(),
            permission: permission.into(),
            patterns,
            metadata: serde_json::Value::Null,
            message_id: None,
            call_id: None,
            allow_always: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

/// Async prompt callback. An `Err` means the prompt could not be delivered.
pub type PermissionHandler =
    Arc<dyn Fn(PermissionRequest) -> BoxFuture<'static, Result<PermissionReply>> + Send + Sync>;

#[derive(Clone)]
pub struct PermissionGate {
    handler: Option<PermissionHandler>,
    controller: Controller,
    bus: Bus,
    approved: Arc<Mutex<HashMap<String, Ruleset>>>,
}

impl PermissionGate {
    /// Without a handler every `ask` resolves as a rejection.
    pub fn new(controller: Controller, bus: Bus, handler: Option<PermissionHandler>) -> Self {
        Self {
            handler,
            controller,
            bus,
            approved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rules the user approved with `always` during this process.
    pub async fn approved(&self, session_id: &str) -> Ruleset {
        self.approved
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the `always` approvals of a deleted session.
    pub async fn forget(&self, session_id: &str) {
        self.approved.lock().await.remove(session_id);
    }

    /// Approve or refuse `request` against `ruleset`, asking the user when no
    /// rule decides. Prompts for one session are presented one at a time.
    pub async fn ask(
        &self,
        request: PermissionRequest,
        ruleset: &Ruleset,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.needs_prompt(&request, ruleset).await? {
            return Ok(());
        }

        let _turn = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Aborted),
            turn = self.controller.permission_turn(&request.session_id) => turn,
        };
        // An earlier prompt may have approved this pattern while we queued.
        if !self.needs_prompt(&request, ruleset).await? {
            return Ok(());
        }

        tracing::debug!(
            session_id = %request.session_id,
            permission = %request.permission,
            patterns = ?request.patterns,
            "asking permission"
        );
        self.bus.publish(BusEvent::PermissionAsked {
            request: request.clone(),
        });

        let reply = match &self.handler {
            Some(handler) => tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Aborted),
                reply = handler(request.clone()) => reply.unwrap_or_else(|error| {
                    tracing::warn!(error = %error, session_id = %request.session_id, "permission prompt failed; rejecting");
                    PermissionReply::Reject
                }),
            },
            None => PermissionReply::Reject,
        };

        tracing::debug!(session_id = %request.session_id, reply = ?reply, "permission replied");
        self.bus.publish(BusEvent::PermissionReplied {
            session_id: request.session_id.clone(),
            request_id: request.id.clone(),
            reply,
        });

        match reply {
            PermissionReply::Once => Ok(()),
            PermissionReply::Always => {
                if request.allow_always {
                    let mut approved = self.approved.lock().await;
                    let rules = approved.entry(request.session_id.clone()).or_default();
                    for pattern in &request.patterns {
                        rules.push(PermissionRule::new(
                            request.permission.clone(),
                            pattern.clone(),
                            PermissionAction::Allow,
                        ));
                    }
                }
                Ok(())
            }
            PermissionReply::Reject => Err(SessionError::PermissionRejected {
                permission: request.permission.clone(),
                pattern: request.patterns.join(", "),
            }),
        }
    }

    /// `Ok(true)` when some pattern resolves to `ask`; a `deny` anywhere fails fast.
    async fn needs_prompt(&self, request: &PermissionRequest, ruleset: &Ruleset) -> Result<bool> {
        let effective = if request.allow_always {
            let approved = self.approved(&request.session_id).await;
            Ruleset::merge(&[ruleset, &approved])
        } else {
            ruleset.clone()
        };
        let mut ask = false;
        for pattern in &request.patterns {
            match effective.evaluate(&request.permission, pattern) {
                PermissionAction::Deny => {
                    return Err(SessionError::PermissionDenied {
                        permission: request.permission.clone(),
                        pattern: pattern.clone(),
                    })
                }
                PermissionAction::Ask => ask = true,
                PermissionAction::Allow => {}
            }
        }
        Ok(ask)
    }
}
