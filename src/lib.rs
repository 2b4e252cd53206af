//! roci-session: session agent loop for roci agents
//!
//! Drives a conversation session through repeated model calls, tool
//! execution, delegated subtasks and context compaction until the latest
//! user message has been answered. Messages and their parts are persisted
//! through a pluggable [`storage::Storage`]; every change is also published
//! on the [`bus::Bus`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use roci_session::prelude::*;
//!
//! # async fn example() -> roci_session::error::Result<()> {
//! let model = ModelInfo::new(ModelRef::new("scripted", "demo"), 128_000, 8_000);
//! let invoker = ScriptedModel::new().with_model(model.clone());
//! invoker.push(ScriptedTurn::text("Hello!"));
//!
//! let session_loop = SessionLoop::builder(Arc::new(MemoryStorage::new()), Arc::new(invoker)).build();
//! let session = session_loop.sessions().create(None, None, ".").await?;
//! let reply = session_loop
//!     .prompt(
//!         PromptInput::builder()
//!             .session_id(session.id)
//!             .model(model.model)
//!             .parts(vec![PartInput::text("Hi")])
//!             .build(),
//!     )
//!     .await?;
//! println!("{}", reply.text());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod agent_loop;
pub mod bus;
pub mod compaction;
pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod id;
pub mod mcp;
pub mod message;
pub mod models;
pub mod permission;
pub mod prelude;
pub mod prompt;
pub mod provider;
pub mod session;
pub mod storage;
pub mod tools;
pub mod types;
pub mod util;
