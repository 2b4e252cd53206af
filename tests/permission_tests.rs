//! Permission prompts as seen from the loop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{reply_with, Harness};
use roci_session::config::LoopConfig;
use roci_session::permission::{PermissionAction, PermissionHandler, PermissionReply, Ruleset};
use roci_session::provider::ScriptedTurn;
use roci_session::message::ToolState;
use roci_session::types::{AgentToolCall, Usage};

fn echo_call(id: &str, text: &str) -> AgentToolCall {
    AgentToolCall {
        id: id.to_string(),
        name: "echo".to_string(),
        arguments: json!({ "text": text }),
    }
}

#[tokio::test]
async fn concurrent_prompts_are_presented_one_at_a_time() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let handler: PermissionHandler = {
        let (active, peak, order) = (active.clone(), peak.clone(), order.clone());
        Arc::new(move |request| {
            let (active, peak, order) = (active.clone(), peak.clone(), order.clone());
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                order.lock().unwrap().push(request.call_id.clone().unwrap_or_default());
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(PermissionReply::Once)
            })
        })
    };
    let h = Harness::with(LoopConfig::default(), move |builder| builder.permission_handler(handler));
    h.model
        .push(ScriptedTurn::ToolCalls {
            calls: vec![echo_call("call_a", "a"), echo_call("call_b", "b")],
            usage: Usage::new(10, 5),
        })
        .push(ScriptedTurn::text("both done"));
    let session_id = h.session().await;

    let reply = h.session_loop.prompt(h.input(&session_id, "two at once")).await.unwrap();
    assert_eq!(reply.text(), "both done");
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock().unwrap(), vec!["call_a".to_string(), "call_b".to_string()]);

    let tools = h.tool_parts(&session_id).await;
    assert_eq!(tools.len(), 2);
    assert!(tools
        .iter()
        .all(|part| matches!(part.state, ToolState::Completed { .. })));
}

#[tokio::test]
async fn always_reply_is_remembered_for_the_session() {
    let asks = Arc::new(AtomicUsize::new(0));
    let handler: PermissionHandler = {
        let asks = asks.clone();
        Arc::new(move |_request| {
            asks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(PermissionReply::Always) })
        })
    };
    let h = Harness::with(LoopConfig::default(), move |builder| builder.permission_handler(handler));
    h.model
        .push(ScriptedTurn::tool_call("echo", json!({ "text": "1" })))
        .push(ScriptedTurn::tool_call("echo", json!({ "text": "2" })))
        .push(ScriptedTurn::text("done"));
    let session_id = h.session().await;

    h.session_loop.prompt(h.input(&session_id, "twice")).await.unwrap();
    assert_eq!(asks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deleting_a_session_forgets_its_approvals() {
    let h = Harness::with(LoopConfig::default(), |builder| {
        builder.permission_handler(reply_with(PermissionReply::Always))
    });
    h.model
        .push(ScriptedTurn::tool_call("echo", json!({ "text": "1" })))
        .push(ScriptedTurn::text("done"));
    let session_id = h.session().await;
    h.session_loop.prompt(h.input(&session_id, "once")).await.unwrap();
    assert!(!h.session_loop.permissions().approved(&session_id).await.is_empty());

    h.session_loop.delete(&session_id).await.unwrap();
    assert!(h.session_loop.permissions().approved(&session_id).await.is_empty());
    assert!(h.session_loop.sessions().get(&session_id).await.is_err());
    assert!(!h.session_loop.is_busy(&session_id));
}

#[tokio::test]
async fn rejection_stops_the_loop() {
    let h = Harness::with(LoopConfig::default(), |builder| {
        builder.permission_handler(reply_with(PermissionReply::Reject))
    });
    h.model
        .push(ScriptedTurn::tool_call("echo", json!({ "text": "no" })))
        .push(ScriptedTurn::text("never sent"));
    let session_id = h.session().await;

    let reply = h.session_loop.prompt(h.input(&session_id, "try")).await.unwrap();
    assert_eq!(h.model.requests().len(), 1);
    assert_eq!(h.model.remaining(), 1);
    let tool = reply.tool_parts().next().unwrap();
    assert!(matches!(tool.state, ToolState::Error { .. }));
}

#[tokio::test]
async fn rejection_can_be_shown_to_the_model_instead() {
    let config = LoopConfig::default().with_continue_on_deny(true);
    let h = Harness::with(config, |builder| builder.permission_handler(reply_with(PermissionReply::Reject)));
    h.model
        .push(ScriptedTurn::tool_call("echo", json!({ "text": "no" })))
        .push(ScriptedTurn::text("understood"));
    let session_id = h.session().await;

    let reply = h.session_loop.prompt(h.input(&session_id, "try")).await.unwrap();
    assert_eq!(reply.text(), "understood");
}

#[tokio::test]
async fn denied_tools_are_not_offered() {
    let h = Harness::new();
    h.model.push(ScriptedTurn::text("ok"));
    let session_id = h.session().await;
    h.session_loop
        .sessions()
        .set_permission(&session_id, Ruleset::default().with("echo", "*", PermissionAction::Deny))
        .await
        .unwrap();

    h.session_loop.prompt(h.input(&session_id, "hi")).await.unwrap();
    let requests = h.model.requests();
    assert!(requests[0].tools.iter().all(|tool| tool.name != "echo"));
    assert!(requests[0].tools.iter().any(|tool| tool.name == "task"));
}
