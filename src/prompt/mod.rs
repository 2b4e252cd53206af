//! Prompt Builder: turns prompt input into a persisted user message.
//!
//! File references are resolved into the message itself. A readable text file
//! becomes a synthetic "Called the Read tool" narration followed by its
//! contents, so the model sees the trace it would have produced by reading the
//! file on its own.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentRegistry, DEFAULT_AGENT};
use crate::error::{Result, SessionError};
use crate::hooks::Hooks;
use crate::mcp::{McpHub, McpResourceContent};
use crate::message::{
    AgentPart, FilePart, FileSource, MessageInfo, MessageWithParts, Part, PartBase, SubtaskPart, TextPart,
    TextSpan, UserMessage, DIRECTORY_MIME,
};
use crate::models::ModelRef;
use crate::session::Sessions;
use crate::tools::TruncationPolicy;

const DIRECTORY_LISTING_LIMIT: usize = 200;
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// One piece of user input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartInput {
    Text {
        text: String,
        #[serde(default)]
        synthetic: bool,
    },
    File {
        url: String,
        mime: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        source: Option<FileSource>,
    },
    /// An `@agent` mention.
    Agent {
        name: String,
        #[serde(default)]
        source: Option<TextSpan>,
    },
    Subtask {
        prompt: String,
        description: String,
        agent: String,
        #[serde(default)]
        model: Option<ModelRef>,
        #[serde(default)]
        command: Option<String>,
    },
}

impl PartInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: false,
        }
    }

    pub fn file(url: impl Into<String>, mime: impl Into<String>) -> Self {
        Self::File {
            url: url.into(),
            mime: mime.into(),
            filename: None,
            source: None,
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self::Agent {
            name: name.into(),
            source: None,
        }
    }

    pub fn subtask(agent: impl Into<String>, description: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::Subtask {
            prompt: prompt.into(),
            description: description.into(),
            agent: agent.into(),
            model: None,
            command: None,
        }
    }
}

/// Input to [`PromptBuilder::build_user_message`] and the loop's `prompt`.
#[derive(Debug, Clone, Builder)]
pub struct PromptInput {
    #[builder(into)]
    pub session_id: String,
    /// Use this id for the user message instead of a fresh one.
    #[builder(into)]
    pub message_id: Option<String>,
    pub model: Option<ModelRef>,
    #[builder(into)]
    pub agent: Option<String>,
    /// Persist the message without starting a generation.
    #[builder(default)]
    pub no_reply: bool,
    #[builder(into)]
    pub system: Option<String>,
    pub tools: Option<HashMap<String, bool>>,
    #[builder(default)]
    pub parts: Vec<PartInput>,
}

#[derive(Clone)]
pub struct PromptBuilder {
    sessions: Sessions,
    agents: AgentRegistry,
    hooks: Hooks,
    mcp: Option<McpHub>,
    default_model: Option<ModelRef>,
    truncation: TruncationPolicy,
}

impl PromptBuilder {
    pub fn new(sessions: Sessions, agents: AgentRegistry, hooks: Hooks) -> Self {
        Self {
            sessions,
            agents,
            hooks,
            mcp: None,
            default_model: None,
            truncation: TruncationPolicy::default(),
        }
    }

    /// Size limit applied to inlined file text.
    pub fn with_truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn with_mcp(mut self, mcp: McpHub) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_default_model(mut self, model: ModelRef) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Build the user message for `input`, persist it with all its parts and
    /// return it.
    pub async fn build_user_message(&self, input: PromptInput) -> Result<MessageWithParts> {
        let session = self.sessions.get(&input.session_id).await?;
        let agent = self
            .agents
            .get(input.agent.as_deref().unwrap_or(DEFAULT_AGENT))?;
        let model = self.resolve_model(&input, agent.model.as_ref()).await?;

        let mut info = UserMessage::new(&session.id, &agent.name, model);
        if let Some(id) = input.message_id {
            info.id = id;
        }
        info.system = input.system;
        info.tools = input.tools;

        let mut parts = Vec::new();
        for part in input.parts {
            self.resolve_part(&info, part, &mut parts).await?;
        }

        let messages = self.sessions.messages();
        messages.update_message(&MessageInfo::User(info.clone())).await?;
        for part in &parts {
            messages.update_part(part).await?;
        }
        self.sessions.touch(&session.id).await?;
        tracing::debug!(session_id = %session.id, message_id = %info.id, parts = parts.len(), "user message stored");

        let message = MessageWithParts::new(info, parts);
        self.hooks.chat_message(&message).await;
        Ok(message)
    }

    /// Explicit input, then the agent's model, then the session's last
    /// user message, then the configured default.
    async fn resolve_model(&self, input: &PromptInput, agent_model: Option<&ModelRef>) -> Result<ModelRef> {
        if let Some(model) = input.model.clone().or_else(|| agent_model.cloned()) {
            return Ok(model);
        }
        let history = self.sessions.messages().list(&input.session_id).await?;
        history
            .iter()
            .rev()
            .find_map(|message| message.info.as_user().map(|user| user.model.clone()))
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| SessionError::InvalidArgument("no model selected for prompt".into()))
    }

    async fn resolve_part(&self, info: &UserMessage, input: PartInput, parts: &mut Vec<Part>) -> Result<()> {
        let (sid, mid) = (info.session_id.as_str(), info.id.as_str());
        match input {
            PartInput::Text { text, synthetic } => {
                let mut part = TextPart::new(sid, mid, text);
                part.synthetic = synthetic;
                parts.push(Part::Text(part));
            }
            PartInput::Agent { name, source } => {
                let agent = self.agents.get(&name)?;
                parts.push(Part::Agent(AgentPart {
                    base: PartBase::new(sid, mid),
                    name: agent.name.clone(),
                    source,
                }));
                parts.push(Part::Text(TextPart::synthetic(
                    sid,
                    mid,
                    format!(
                        "Use the above message and context to generate a prompt and call the task tool with subagent: {}",
                        agent.name
                    ),
                )));
            }
            PartInput::Subtask {
                prompt,
                description,
                agent,
                model,
                command,
            } => parts.push(Part::Subtask(SubtaskPart {
                base: PartBase::new(sid, mid),
                prompt,
                description,
                agent,
                model,
                command,
            })),
            PartInput::File {
                url,
                mime,
                filename,
                source,
            } => {
                let file = FileRef {
                    filename: filename.unwrap_or_else(|| filename_from_url(&url)),
                    url,
                    mime,
                    source,
                };
                self.resolve_file(sid, mid, file, parts).await?;
            }
        }
        Ok(())
    }

    async fn resolve_file(&self, sid: &str, mid: &str, file: FileRef, parts: &mut Vec<Part>) -> Result<()> {
        if let Some((client, uri)) = file.mcp_resource() {
            return self.resolve_mcp_resource(sid, mid, file, &client, &uri, parts).await;
        }
        if file.url.starts_with("data:") {
            if let Some(text) = decode_data_url_text(&file.url, &file.mime) {
                parts.push(narration(sid, mid, serde_json::json!({ "filePath": file.filename })));
                parts.push(Part::Text(TextPart::synthetic(sid, mid, text)));
            }
            parts.push(file.into_part(sid, mid));
            return Ok(());
        }
        let Ok(parsed) = url::Url::parse(&file.url) else {
            parts.push(file.into_part(sid, mid));
            return Ok(());
        };
        if parsed.scheme() != "file" {
            parts.push(file.into_part(sid, mid));
            return Ok(());
        }
        let Ok(path) = parsed.to_file_path() else {
            parts.push(Part::Text(TextPart::synthetic(sid, mid, format!("Invalid file path URL `{}`", file.url))));
            parts.push(file.into_part(sid, mid));
            return Ok(());
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                parts.push(read_failure(sid, mid, &path, &err));
                parts.push(file.into_part(sid, mid));
                return Ok(());
            }
        };

        if metadata.is_dir() {
            parts.push(narration(sid, mid, serde_json::json!({ "filePath": path.display().to_string() })));
            parts.push(Part::Text(TextPart::synthetic(sid, mid, list_directory(&path).await)));
            parts.push(file.with_mime(DIRECTORY_MIME).into_part(sid, mid));
            return Ok(());
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                parts.push(read_failure(sid, mid, &path, &err));
                parts.push(file.into_part(sid, mid));
                return Ok(());
            }
        };

        if is_binary_asset_mime(&file.mime) {
            let data_url = format!(
                "data:{};base64,{}",
                file.mime,
                base64::engine::general_purpose::STANDARD.encode(bytes)
            );
            parts.push(
                FileRef {
                    url: data_url,
                    ..file
                }
                .into_part(sid, mid),
            );
            return Ok(());
        }

        if is_binary(&bytes) {
            parts.push(Part::Text(TextPart::synthetic(
                sid,
                mid,
                format!("Read tool failed to read {}: cannot read binary file", path.display()),
            )));
            parts.push(file.into_part(sid, mid));
            return Ok(());
        }

        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        let mut read_args = serde_json::json!({ "filePath": path.display().to_string() });
        if let Some((start, end)) = line_window(&parsed) {
            text = slice_lines(&text, start, end);
            read_args["offset"] = serde_json::json!(start);
            if let Some(end) = end {
                read_args["limit"] = serde_json::json!(end.saturating_sub(start).saturating_add(1));
            }
        }
        parts.push(narration(sid, mid, read_args));
        parts.push(Part::Text(TextPart::synthetic(sid, mid, self.truncation.apply(&text))));
        parts.push(file.with_mime("text/plain").into_part(sid, mid));
        Ok(())
    }

    async fn resolve_mcp_resource(
        &self,
        sid: &str,
        mid: &str,
        file: FileRef,
        client: &str,
        uri: &str,
        parts: &mut Vec<Part>,
    ) -> Result<()> {
        let Some(mcp) = &self.mcp else {
            parts.push(Part::Text(TextPart::synthetic(
                sid,
                mid,
                format!("Failed to read MCP resource `{uri}`: no MCP servers are connected"),
            )));
            return Ok(());
        };
        parts.push(Part::Text(TextPart::synthetic(
            sid,
            mid,
            format!("Reading MCP resource: {} ({uri})", file.filename),
        )));

        let contents = match mcp.read_resource(client, uri).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(client, uri, error = %err, "mcp resource read failed");
                parts.push(Part::Text(TextPart::synthetic(
                    sid,
                    mid,
                    format!("Failed to read MCP resource `{uri}`: {err}"),
                )));
                return Ok(());
            }
        };

        let mut texts = Vec::new();
        for content in contents {
            match content {
                McpResourceContent::Text { text, .. } => {
                    if !text.trim().is_empty() {
                        texts.push(text);
                    }
                }
                McpResourceContent::Blob { uri, mime_type, blob } => {
                    let mime = mime_type.unwrap_or_else(|| file.mime.clone());
                    parts.push(Part::File(FilePart {
                        base: PartBase::new(sid, mid),
                        url: format!("data:{mime};base64,{blob}"),
                        mime,
                        filename: Some(uri.clone()),
                        source: Some(FileSource::Resource {
                            client_name: client.to_string(),
                            uri,
                        }),
                    }));
                }
            }
        }
        if !texts.is_empty() {
            parts.push(Part::Text(TextPart::synthetic(sid, mid, texts.join("\n\n"))));
            let source = Some(FileSource::Resource {
                client_name: client.to_string(),
                uri: uri.to_string(),
            });
            parts.push(FileRef { source, ..file }.with_mime("text/plain").into_part(sid, mid));
        }
        Ok(())
    }
}

struct FileRef {
    url: String,
    mime: String,
    filename: String,
    source: Option<FileSource>,
}

impl FileRef {
    fn with_mime(mut self, mime: &str) -> Self {
        self.mime = mime.to_string();
        self
    }

    /// `(client, uri)` for `mcp://client/uri` or an explicit resource source.
    fn mcp_resource(&self) -> Option<(String, String)> {
        if let Some(FileSource::Resource { client_name, uri }) = &self.source {
            return Some((client_name.clone(), uri.clone()));
        }
        let parsed = url::Url::parse(&self.url).ok()?;
        if parsed.scheme() != "mcp" {
            return None;
        }
        let client = parsed.host_str()?.to_string();
        let mut uri = parsed.path().trim_start_matches('/').to_string();
        if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }
        (!uri.is_empty()).then_some((client, uri))
    }

    fn into_part(self, sid: &str, mid: &str) -> Part {
        Part::File(FilePart {
            base: PartBase::new(sid, mid),
            mime: self.mime,
            filename: (!self.filename.is_empty()).then_some(self.filename),
            url: self.url,
            source: self.source,
        })
    }
}

fn narration(sid: &str, mid: &str, args: serde_json::Value) -> Part {
    Part::Text(TextPart::synthetic(
        sid,
        mid,
        format!("Called the Read tool with the following input: {args}"),
    ))
}

/// NUL bytes or invalid UTF-8 in the leading chunk. A multi-byte character
/// cut by the chunk boundary does not count.
fn is_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if head.contains(&0) {
        return true;
    }
    match std::str::from_utf8(head) {
        Ok(_) => false,
        Err(err) => err.error_len().is_some(),
    }
}

fn read_failure(sid: &str, mid: &str, path: &Path, err: &std::io::Error) -> Part {
    Part::Text(TextPart::synthetic(
        sid,
        mid,
        format!("Read tool failed to read {} with error: {err}", path.display()),
    ))
}

fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back().map(str::to_string))
        })
        .unwrap_or_default()
}

/// `?start=N&end=M` on a file URL, 1-based and inclusive.
fn line_window(url: &url::Url) -> Option<(usize, Option<usize>)> {
    let get = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .map(|n| n.max(1))
    };
    Some((get("start")?, get("end")))
}

fn slice_lines(text: &str, start: usize, end: Option<usize>) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let from = start.saturating_sub(1).min(lines.len());
    let to = end.unwrap_or(lines.len()).min(lines.len());
    if from >= to {
        return String::new();
    }
    lines[from..to].join("\n")
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json" | "application/xml" | "application/javascript" | "application/x-sh"
        )
}

fn is_binary_asset_mime(mime: &str) -> bool {
    mime.starts_with("image/") || mime == "application/pdf"
}

fn decode_data_url_text(url: &str, mime: &str) -> Option<String> {
    if !is_text_mime(mime) {
        return None;
    }
    let (header, payload) = url.split_once(',')?;
    if header.contains(";base64") {
        let bytes = base64::engine::general_purpose::STANDARD.decode(payload.as_bytes()).ok()?;
        return Some(String::from_utf8_lossy(&bytes).to_string());
    }
    Some(payload.to_string())
}

async fn list_directory(path: &Path) -> String {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) => return format!("Failed to list directory {}: {err}", path.display()),
    };
    let mut names = Vec::new();
    let mut truncated = false;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if names.len() >= DIRECTORY_LISTING_LIMIT {
            truncated = true;
            break;
        }
        let mut name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    if names.is_empty() {
        return format!("Directory is empty: {}", path.display());
    }
    names.sort();
    if truncated {
        names.push("... (truncated)".to_string());
    }
    names.join("\n")
}
