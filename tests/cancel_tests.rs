//! Cancellation, busy sessions and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use common::{gated_tool, hanging_tool, no_args, Harness};
use roci_session::config::LoopConfig;
use roci_session::error::{Result, SessionError};
use roci_session::message::{MessageInfo, ToolState, ToolStatus};
use roci_session::provider::ScriptedTurn;
use roci_session::storage::{MemoryStorage, Storage};
use roci_session::tools::INTERRUPTED_ERROR;

/// Holds back writes of failed tool parts, keeping a cancelled generation
/// busy with its teardown for a while.
struct SlowErrorWrites {
    inner: MemoryStorage,
    delay: Duration,
}

#[async_trait]
impl Storage for SlowErrorWrites {
    async fn write(&self, keys: &[&str], data: &Value) -> Result<()> {
        if data.pointer("/state/status").and_then(Value::as_str) == Some("error") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.write(keys, data).await
    }

    async fn read(&self, keys: &[&str]) -> Result<Option<Value>> {
        self.inner.read(keys).await
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        self.inner.remove(keys).await
    }
}

fn with_hang() -> Harness {
    Harness::with(LoopConfig::default(), |builder| builder.tool(hanging_tool()))
}

#[tokio::test]
async fn cancelling_an_idle_session_is_a_no_op() {
    let h = Harness::new();
    let session_id = h.session().await;
    h.session_loop.cancel(&session_id);
    h.session_loop.cancel(&session_id);
    assert!(!h.session_loop.is_busy(&session_id));

    h.model.push(ScriptedTurn::text("still works"));
    let reply = h.session_loop.prompt(h.input(&session_id, "hi")).await.unwrap();
    assert_eq!(reply.text(), "still works");
}

#[tokio::test]
async fn cancel_interrupts_running_tool() {
    let h = with_hang();
    h.model.push(ScriptedTurn::tool_call("hang", no_args()));
    let session_id = h.session().await;

    let run = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "hang please");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    h.wait_for_running_tool(&session_id).await;
    h.session_loop.cancel(&session_id);
    h.session_loop.cancel(&session_id);

    let result = run.await.unwrap();
    assert!(matches!(result, Err(SessionError::Aborted)));
    assert!(!h.session_loop.is_busy(&session_id));

    let tools = h.tool_parts(&session_id).await;
    assert_eq!(tools.len(), 1);
    match &tools[0].state {
        ToolState::Error { error, .. } => assert_eq!(error, INTERRUPTED_ERROR),
        other => panic!("unexpected state {other:?}"),
    }

    let history = h.history(&session_id).await;
    let MessageInfo::Assistant(assistant) = &history[1].info else {
        panic!("expected assistant");
    };
    assert!(assistant.error.is_none());
    assert!(assistant.time.completed.is_some());
}

#[tokio::test]
async fn cancel_rejects_waiters() {
    let h = with_hang();
    h.model.push(ScriptedTurn::tool_call("hang", no_args()));
    let session_id = h.session().await;

    let first = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "first");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    h.wait_for_running_tool(&session_id).await;
    let waiter = {
        let session_loop = h.session_loop.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { session_loop.run(&session_id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.session_loop.cancel(&session_id);

    assert!(matches!(first.await.unwrap(), Err(SessionError::Aborted)));
    assert!(matches!(waiter.await.unwrap(), Err(SessionError::Aborted)));
}

#[tokio::test]
async fn a_cancelled_generation_leaves_the_next_one_alone() {
    let storage = Arc::new(SlowErrorWrites {
        inner: MemoryStorage::new(),
        delay: Duration::from_millis(200),
    });
    let h = Harness::with_storage(storage, LoopConfig::default(), |builder| builder.tool(hanging_tool()));
    h.model
        .push(ScriptedTurn::tool_call("hang", no_args()))
        .push(ScriptedTurn::tool_call("hang", no_args()));
    let session_id = h.session().await;

    let first = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "first");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    h.wait_for_running_tool(&session_id).await;
    h.session_loop.cancel(&session_id);

    let second = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "second");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    for _ in 0..200 {
        let tools = h.tool_parts(&session_id).await;
        if tools.len() == 2 && tools[1].state.status() == ToolStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(first.await.unwrap(), Err(SessionError::Aborted)));
    assert!(h.session_loop.is_busy(&session_id));
    let tools = h.tool_parts(&session_id).await;
    assert_eq!(tools.len(), 2);
    assert!(matches!(&tools[0].state, ToolState::Error { error, .. } if error == INTERRUPTED_ERROR));
    assert_eq!(tools[1].state.status(), ToolStatus::Running);
    let history = h.history(&session_id).await;
    let current = history.last().and_then(|message| message.info.as_assistant()).unwrap();
    assert!(current.time.completed.is_none());

    h.session_loop.cancel(&session_id);
    assert!(matches!(second.await.unwrap(), Err(SessionError::Aborted)));
    let tools = h.tool_parts(&session_id).await;
    assert!(matches!(&tools[1].state, ToolState::Error { error, .. } if error == INTERRUPTED_ERROR));
}

#[tokio::test]
async fn try_prompt_on_a_busy_session_stores_nothing() {
    let release = Arc::new(Notify::new());
    let tool = gated_tool(release.clone());
    let h = Harness::with(LoopConfig::default(), move |builder| builder.tool(tool));
    h.model
        .push(ScriptedTurn::tool_call("wait", no_args()))
        .push(ScriptedTurn::text("done"));
    let session_id = h.session().await;

    let run = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "go");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    h.wait_for_running_tool(&session_id).await;
    let before = h.history(&session_id).await.len();

    let err = h
        .session_loop
        .try_prompt(h.input(&session_id, "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Busy { .. }));
    assert_eq!(h.history(&session_id).await.len(), before);

    release.notify_one();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn try_prompt_without_reply_releases_the_session() {
    let h = Harness::new();
    let session_id = h.session().await;
    let mut input = h.input(&session_id, "just store this");
    input.no_reply = true;

    let message = h.session_loop.try_prompt(input).await.unwrap();
    assert!(message.info.as_user().is_some());
    assert!(!h.session_loop.is_busy(&session_id));
    assert!(h.model.requests().is_empty());
}

#[tokio::test]
async fn try_prompt_reports_busy() {
    let release = Arc::new(Notify::new());
    let tool = gated_tool(release.clone());
    let h = Harness::with(LoopConfig::default(), move |builder| builder.tool(tool));
    h.model
        .push(ScriptedTurn::tool_call("wait", no_args()))
        .push(ScriptedTurn::text("done"));
    let session_id = h.session().await;

    let run = {
        let session_loop = h.session_loop.clone();
        let input = h.input(&session_id, "go");
        tokio::spawn(async move { session_loop.prompt(input).await })
    };
    h.wait_until_busy(&session_id).await;

    let err = h
        .session_loop
        .try_prompt(h.input(&session_id, "again"))
        .await
        .unwrap_err();
    assert!(matches!(&err, SessionError::Busy { session_id: id } if id == &session_id));
    let err = h
        .session_loop
        .summarize(&session_id, common::model_info().model)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Busy { .. }));

    release.notify_one();
    assert_eq!(run.await.unwrap().unwrap().text(), "done");
}

#[tokio::test]
async fn shutdown_aborts_every_session() {
    let h = with_hang();
    h.model
        .push(ScriptedTurn::tool_call("hang", no_args()))
        .push(ScriptedTurn::tool_call("hang", no_args()));
    let a = h.session().await;
    let b = h.session().await;

    let runs: Vec<_> = [&a, &b]
        .into_iter()
        .map(|session_id| {
            let session_loop = h.session_loop.clone();
            let input = h.input(session_id, "hang");
            tokio::spawn(async move { session_loop.prompt(input).await })
        })
        .collect();
    h.wait_for_running_tool(&a).await;
    h.wait_for_running_tool(&b).await;

    h.session_loop.shutdown();
    for run in runs {
        assert!(matches!(run.await.unwrap(), Err(SessionError::Aborted)));
    }
    assert!(h.session_loop.controller().active_sessions().is_empty());
}
