//! Prompt building: file inlining, directories, mentions and MCP resources.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::Harness;
use roci_session::config::LoopConfig;
use roci_session::error::Result;
use roci_session::mcp::{McpClient, McpHub, McpResourceContent, McpToolResult, McpToolSchema};
use roci_session::message::{MessageWithParts, Part, DIRECTORY_MIME};
use roci_session::prompt::{PartInput, PromptInput};
use roci_session::provider::ScriptedTurn;

fn stored(session_id: &str, parts: Vec<PartInput>) -> PromptInput {
    PromptInput::builder()
        .session_id(session_id)
        .model(common::model_info().model)
        .no_reply(true)
        .parts(parts)
        .build()
}

fn synthetic_texts(message: &MessageWithParts) -> Vec<String> {
    message
        .parts
        .iter()
        .filter_map(Part::as_text)
        .filter(|text| text.synthetic)
        .map(|text| text.text.clone())
        .collect()
}

fn file_url(path: &std::path::Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

#[tokio::test]
async fn text_files_are_inlined_as_a_read_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();

    let h = Harness::new();
    h.model.push(ScriptedTurn::text("read it"));
    let session_id = h.session().await;
    let input = PromptInput::builder()
        .session_id(&session_id)
        .model(common::model_info().model)
        .parts(vec![
            PartInput::text("summarize this"),
            PartInput::file(file_url(&path), "text/plain"),
        ])
        .build();
    h.session_loop.prompt(input).await.unwrap();

    let user = &h.history(&session_id).await[0];
    let texts = synthetic_texts(user);
    assert_eq!(texts.len(), 2);
    assert!(texts[0].starts_with("Called the Read tool with the following input:"));
    assert!(texts[0].contains("notes.txt"));
    assert_eq!(texts[1], "alpha\nbeta\ngamma\n");

    let file = user
        .parts
        .iter()
        .find_map(|part| match part {
            Part::File(file) => Some(file),
            _ => None,
        })
        .unwrap();
    assert_eq!(file.mime, "text/plain");
    assert_eq!(file.filename.as_deref(), Some("notes.txt"));

    let request = &h.model.requests()[0];
    assert!(request.messages[0].text().contains("beta"));
}

#[tokio::test]
async fn line_windows_limit_the_inlined_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long.txt");
    std::fs::write(&path, "1\n2\n3\n4\n5\n").unwrap();

    let h = Harness::new();
    let session_id = h.session().await;
    let url = format!("{}?start=2&end=3", file_url(&path));
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::file(url, "text/plain")]))
        .await
        .unwrap();

    let texts = synthetic_texts(&message);
    assert!(texts[0].contains("\"offset\":2"));
    assert!(texts[0].contains("\"limit\":2"));
    assert_eq!(texts[1], "2\n3");
}

#[tokio::test]
async fn binary_files_are_not_inlined() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    std::fs::write(&path, [0u8, 0xff, 0xfe, 0x80, 0x81, 0, 1, 2]).unwrap();

    let h = Harness::new();
    let session_id = h.session().await;
    let message = h
        .session_loop
        .prompt(stored(
            &session_id,
            vec![PartInput::file(file_url(&path), "application/octet-stream")],
        ))
        .await
        .unwrap();

    let texts = synthetic_texts(&message);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("cannot read binary file"));
    assert!(texts[0].contains("blob.bin"));
    assert!(texts.iter().all(|text| !text.contains('\u{fffd}')));

    let file = message
        .parts
        .iter()
        .find_map(|part| match part {
            Part::File(file) => Some(file),
            _ => None,
        })
        .unwrap();
    assert_eq!(file.mime, "application/octet-stream");
}

#[tokio::test]
async fn large_text_files_are_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.log");
    let body = (1..=50).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
    std::fs::write(&path, body).unwrap();

    let mut config = LoopConfig::default();
    config.tool_output_max_lines = 5;
    let h = Harness::with(config, |builder| builder);
    let session_id = h.session().await;
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::file(file_url(&path), "text/plain")]))
        .await
        .unwrap();

    let texts = synthetic_texts(&message);
    assert!(texts[1].starts_with("line 1\nline 2"));
    assert!(!texts[1].contains("line 6\n"));
    assert!(texts[1].contains("[Output truncated: showed 5 of 50 lines"));
}

#[tokio::test]
async fn directories_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.rs"), "").unwrap();
    std::fs::create_dir(dir.path().join("a")).unwrap();

    let h = Harness::new();
    let session_id = h.session().await;
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::file(file_url(dir.path()), "text/plain")]))
        .await
        .unwrap();

    let texts = synthetic_texts(&message);
    assert_eq!(texts[1], "a/\nb.rs");
    assert!(message
        .parts
        .iter()
        .any(|part| matches!(part, Part::File(file) if file.mime == DIRECTORY_MIME)));
}

#[tokio::test]
async fn unreadable_files_become_a_failure_note() {
    let h = Harness::new();
    let session_id = h.session().await;
    let missing = std::env::temp_dir().join("roci-session-missing-file.txt");
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::file(file_url(&missing), "text/plain")]))
        .await
        .unwrap();

    let texts = synthetic_texts(&message);
    assert!(texts[0].starts_with("Read tool failed to read"));
}

#[tokio::test]
async fn images_become_data_urls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pixel.png");
    std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

    let h = Harness::new();
    let session_id = h.session().await;
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::file(file_url(&path), "image/png")]))
        .await
        .unwrap();

    let Some(Part::File(file)) = message.parts.first() else {
        panic!("expected a file part");
    };
    assert_eq!(file.url, "data:image/png;base64,iVBORw==");
}

#[tokio::test]
async fn agent_mentions_ask_for_delegation() {
    let h = Harness::new();
    let session_id = h.session().await;
    let message = h
        .session_loop
        .prompt(stored(&session_id, vec![PartInput::text("check this"), PartInput::agent("general")]))
        .await
        .unwrap();

    assert!(message
        .parts
        .iter()
        .any(|part| matches!(part, Part::Agent(agent) if agent.name == "general")));
    let texts = synthetic_texts(&message);
    assert_eq!(
        texts,
        vec!["Use the above message and context to generate a prompt and call the task tool with subagent: general"]
    );
}

struct Docs;

#[async_trait]
impl McpClient for Docs {
    fn name(&self) -> &str {
        "docs"
    }

    async fn list_tools(&self) -> Result<Vec<McpToolSchema>> {
        Ok(vec![McpToolSchema {
            name: "search".into(),
            description: Some("Search the docs".into()),
            input_schema: json!({ "type": "object", "properties": { "q": { "type": "string" } } }),
        }])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<McpToolResult> {
        Ok(McpToolResult::default())
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContent>> {
        Ok(vec![McpResourceContent::Text {
            uri: uri.to_string(),
            mime_type: Some("text/markdown".into()),
            text: "# Guide\nhello".into(),
        }])
    }
}

#[tokio::test]
async fn mcp_resources_are_fetched_and_mcp_tools_offered() {
    let hub = McpHub::new();
    hub.add(Arc::new(Docs));
    let h = Harness::with(LoopConfig::default(), move |builder| builder.mcp(hub));
    h.model.push(ScriptedTurn::text("thanks"));
    let session_id = h.session().await;

    let input = PromptInput::builder()
        .session_id(&session_id)
        .model(common::model_info().model)
        .parts(vec![PartInput::file("mcp://docs/guide.md", "text/markdown")])
        .build();
    h.session_loop.prompt(input).await.unwrap();

    let user = &h.history(&session_id).await[0];
    let texts = synthetic_texts(user);
    assert!(texts[0].starts_with("Reading MCP resource:"));
    assert_eq!(texts[1], "# Guide\nhello");

    let request = &h.model.requests()[0];
    assert!(request.tools.iter().any(|tool| tool.name == "docs_search"));
}
