//! Tool execution as seen through the loop.

mod common;

use serde_json::json;

use common::{no_args, Harness};
use roci_session::config::LoopConfig;
use roci_session::message::ToolState;
use roci_session::provider::ScriptedTurn;
use roci_session::tools::{FunctionTool, ToolOutput, ToolParameters};

#[tokio::test]
async fn long_output_is_truncated_before_it_is_stored() {
    let mut config = LoopConfig::default();
    config.tool_output_max_lines = 2;
    let h = Harness::with(config, |builder| {
        builder.tool(std::sync::Arc::new(FunctionTool::new(
            "lines",
            "Print many lines",
            ToolParameters::empty(),
            |_args, _ctx| async move {
                let text = (1..=10).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
                Ok(ToolOutput::text("lines", text))
            },
        )))
    });
    h.model
        .push(ScriptedTurn::tool_call("lines", no_args()))
        .push(ScriptedTurn::text("ok"));
    let session_id = h.session().await;
    h.session_loop.prompt(h.input(&session_id, "print")).await.unwrap();

    let tools = h.tool_parts(&session_id).await;
    match &tools[0].state {
        ToolState::Completed { output, .. } => {
            assert!(output.starts_with("1\n2"));
            assert!(output.contains("[Output truncated: showed 2 of 10 lines"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn invalid_arguments_fail_without_running_the_tool() {
    let h = Harness::new();
    h.model
        .push(ScriptedTurn::tool_call("echo", json!({ "text": 5 })))
        .push(ScriptedTurn::text("retrying"));
    let session_id = h.session().await;

    let reply = h.session_loop.prompt(h.input(&session_id, "echo")).await.unwrap();
    assert_eq!(reply.text(), "retrying");
    assert_eq!(h.asks.load(std::sync::atomic::Ordering::SeqCst), 0);

    let tools = h.tool_parts(&session_id).await;
    assert!(matches!(&tools[0].state, ToolState::Error { .. }));
}

#[tokio::test]
async fn tool_errors_are_reported_not_raised() {
    let h = Harness::with(LoopConfig::default(), |builder| {
        builder.tool(std::sync::Arc::new(FunctionTool::new(
            "broken",
            "Always fails",
            ToolParameters::empty(),
            |_args, _ctx| async move {
                Err(roci_session::error::SessionError::tool("broken", "disk on fire"))
            },
        )))
    });
    h.model
        .push(ScriptedTurn::tool_call("broken", no_args()))
        .push(ScriptedTurn::text("that failed"));
    let session_id = h.session().await;

    let reply = h.session_loop.prompt(h.input(&session_id, "go")).await.unwrap();
    assert!(reply.info.as_assistant().unwrap().error.is_none());
    let tools = h.tool_parts(&session_id).await;
    match &tools[0].state {
        ToolState::Error { error, .. } => assert!(error.contains("disk on fire")),
        other => panic!("unexpected state {other:?}"),
    }
}
