//! # Forrst
//!
//! **A request/response RPC runtime for intra-service communication.**
//!
//! Forrst dispatches protocol requests to registered functions indexed by
//! URN and semantic version, runs a pluggable extension pipeline around
//! every invocation, tracks long-running calls as async operations, and
//! serves results over HTTP with optional SSE streaming.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Transport │──▶│ RequestHandler│──▶│ FunctionRegistry │
//! │ HTTP+SSE  │   │ parse/assemble│   │ urn × semver     │
//! └───────────┘   └──────┬───────┘   └──────────────────┘
//!                        │
//!            ┌───────────▼────────────┐
//!            │   ExtensionPipeline    │
//!            │ before / around / after│
//!            └───────────┬────────────┘
//!                        ▼
//!                  Function.invoke ──▶ OperationStore (async)
//! ```
//!
//! ## Request flow
//!
//! 1. The **transport** ([`server`]) enforces content type and size
//!    limits, then hands raw bytes to the handler.
//! 2. The **handler** ([`handler`]) parses and validates the envelope,
//!    resolves the call through the [`registry`], and binds arguments
//!    against the function's declared [`schema`].
//! 3. The **pipeline** ([`pipeline`]) runs the active extensions around
//!    the invocation: deadline, cancellation, tracing, idempotency,
//!    caching, quota, dry-run, async divert ([`extensions`]).
//! 4. The response echoes the request id and carries exactly one of
//!    `result` or `errors`, plus extension outputs and server meta
//!    ([`protocol`], [`error`]).
//!
//! ## Quick start
//!
//! ```bash
//! forrst serve                  # start with the demo function set
//! forrst check                  # validate a config file
//! forrst describe               # print the discovery document
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Closed error-code set, HTTP mapping, error objects |
//! | [`urn`] | URN parsing and reserved-namespace policy |
//! | [`version`] | SemVer strictness, stability aliases, resolution |
//! | [`protocol`] | Request/response envelope types and invariants |
//! | [`schema`] | Declared argument schemas and binding |
//! | [`function`] | The `Function` trait and descriptors |
//! | [`registry`] | Startup-frozen function index |
//! | [`context`] | Per-request state: cancellation, deadline, meta |
//! | [`pipeline`] | Extension trait, ordering, hook execution |
//! | [`extensions`] | The built-in extension set |
//! | [`operation`] | Async operation store and lifecycle |
//! | [`system`] | `ping`, `health`, `capabilities`, `describe`, `operation.*` |
//! | [`handler`] | Dispatch orchestration and response assembly |
//! | [`sse`] | SSE streaming adapter |
//! | [`server`] | Axum HTTP transport and headers |
//! | [`runtime`] | Startup wiring (`ServerContext`) |
//! | [`canonical`] | Canonical JSON form for ETags and argument hashes |

pub mod canonical;
pub mod config;
pub mod context;
pub mod error;
pub mod extensions;
pub mod function;
pub mod handler;
pub mod operation;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod server;
pub mod sse;
pub mod system;
pub mod urn;
pub mod version;
