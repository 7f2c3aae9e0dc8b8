//! # toolbridge
//!
//! Tool-serving bridge for agentic coding clients: a lifecycle-managed host
//! that owns a remote code kernel, a hybrid-search knowledge index, a
//! markdown-acquisition pipeline, and a bounded sub-agent loop, all behind a
//! fixed JSON-RPC tool surface.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`kernel`] | Typed HTTP client, process lifecycle, session snapshots, helper injection |
//! | [`knowledge`] | Per-project persistent index: BM25 + vectors + simhash + timeline + keywords |
//! | [`fetch`] | Three-tier markdown cascade with blocklist, freshness, and dual storage |
//! | [`research`] | Topic → candidate URLs → fetch + ingest, with a pluggable resolver |
//! | [`subagent`] | Signature-driven bounded loop alternating model turns and kernel runs |
//! | [`callback`] | Loopback HTTP server for `llm_query` and whitelisted tool callbacks |
//! | [`tools`] | The fixed tool surface: validation, dispatch, structured errors |
//! | [`host`] | Composition root and stdio JSON-RPC serve loop |
//! | [`lm`] | Single-completion language-model clients |
//! | [`error`] | Normalized error kinds shared by every layer |
//!
//! ## Data flow
//!
//! The client calls a named tool on the host. Execution tools route through
//! the kernel manager to the kernel's HTTP surface; knowledge tools hit the
//! per-project index; fetch tools run the cascade and ingest; `sub_agent`
//! drives the bounded loop, whose injected kernel helpers POST back to the
//! callback server; that traffic never re-enters the client's context.

pub mod callback;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod kernel;
pub mod knowledge;
pub mod lm;
pub mod protocol;
pub mod research;
pub mod subagent;
pub mod tools;

pub use error::{BridgeError, BridgeResult};
