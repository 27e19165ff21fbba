//! Per-request invocation state.
//!
//! The [`InvocationContext`] owns the parsed request for the lifetime of a
//! dispatch, carries the cancellation token and deadline, and collects the
//! metadata and extension outputs that the handler folds into the response.
//! Hooks run sequentially within one request; the interior mutexes exist
//! for the streaming path, where the generator task stamps meta while the
//! transport owns the context.
//!
//! Cancellation is cooperative: functions consult
//! [`InvocationContext::check_cancelled`] or park in
//! [`InvocationContext::sleep_cooperative`] at blocking points. Deadline
//! expiry and explicit cancellation are distinct causes; when both have
//! fired, deadline wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, ErrorObject};
use crate::function::{Function, FunctionDescriptor};
use crate::protocol::{JsonMap, Request, ResponseExtension};

#[derive(Default)]
struct DeadlineSlot {
    at: Option<Instant>,
    specified_ms: Option<u64>,
}

pub struct InvocationContext {
    request: Request,
    function: Arc<dyn Function>,
    args: JsonMap,
    started: Instant,
    cancel: CancellationToken,
    deadline: Mutex<DeadlineSlot>,
    meta: Mutex<JsonMap>,
    outputs: Mutex<Vec<ResponseExtension>>,
    /// Extension-private state carried from `before` to `after`.
    scratch: Mutex<JsonMap>,
    dry_run: AtomicBool,
}

impl InvocationContext {
    pub fn new(
        request: Request,
        function: Arc<dyn Function>,
        args: JsonMap,
        default_deadline: Option<Duration>,
    ) -> Self {
        let started = Instant::now();
        let deadline = DeadlineSlot {
            at: default_deadline.map(|d| started + d),
            specified_ms: default_deadline.map(|d| d.as_millis() as u64),
        };
        Self {
            request,
            function,
            args,
            started,
            cancel: CancellationToken::new(),
            deadline: Mutex::new(deadline),
            meta: Mutex::new(JsonMap::new()),
            outputs: Mutex::new(Vec::new()),
            scratch: Mutex::new(JsonMap::new()),
            dry_run: AtomicBool::new(false),
        }
    }

    /// Replace the cancellation token (async workers share the operation's
    /// token so a store-side cancel reaches the running function).
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // ── request access ────────────────────────────────────────────────

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_id(&self) -> &str {
        &self.request.id
    }

    pub fn function(&self) -> &Arc<dyn Function> {
        &self.function
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        self.function.descriptor()
    }

    pub fn args(&self) -> &JsonMap {
        &self.args
    }

    /// `context.caller`, when the caller identified itself.
    pub fn caller(&self) -> Option<&str> {
        self.request.context_str("caller")
    }

    /// Owner identity for async operations: `user_id`, else `caller`,
    /// else anonymous.
    pub fn owner(&self) -> String {
        self.request
            .context_str("user_id")
            .or_else(|| self.request.context_str("caller"))
            .unwrap_or("anonymous")
            .to_string()
    }

    // ── timing ────────────────────────────────────────────────────────

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn set_deadline(&self, at: Instant, specified_ms: u64) {
        let mut slot = self.deadline.lock();
        slot.at = Some(at);
        slot.specified_ms = Some(specified_ms);
    }

    pub fn deadline_instant(&self) -> Option<Instant> {
        self.deadline.lock().at
    }

    pub fn deadline_specified_ms(&self) -> Option<u64> {
        self.deadline.lock().specified_ms
    }

    pub fn deadline_expired(&self) -> bool {
        self.deadline
            .lock()
            .at
            .is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .lock()
            .at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    // ── cancellation ──────────────────────────────────────────────────

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_expired()
    }

    /// The error for this context's cancellation state. Deadline expiry
    /// takes precedence over explicit cancellation.
    pub fn cancellation_error(&self) -> ErrorObject {
        if self.deadline_expired() {
            deadline_exceeded(self.deadline_specified_ms(), self.elapsed_ms())
        } else {
            ErrorObject::new(ErrorCode::Cancelled, "request was cancelled")
        }
    }

    /// Fail fast when cancelled; cooperative functions call this at
    /// blocking points.
    pub fn check_cancelled(&self) -> Result<(), ErrorObject> {
        if self.is_cancelled() {
            Err(self.cancellation_error())
        } else {
            Ok(())
        }
    }

    /// Sleep that honors cancellation and deadline.
    pub async fn sleep_cooperative(&self, duration: Duration) -> Result<(), ErrorObject> {
        let deadline = self.deadline_instant();
        tokio::select! {
            biased;
            _ = wait_until(deadline) => Err(deadline_exceeded(
                self.deadline_specified_ms(),
                self.elapsed_ms(),
            )),
            _ = self.cancel.cancelled() => Err(self.cancellation_error()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    // ── response accumulation ─────────────────────────────────────────

    pub fn set_meta(&self, key: impl Into<String>, value: Value) {
        self.meta.lock().insert(key.into(), value);
    }

    pub fn meta_snapshot(&self) -> JsonMap {
        self.meta.lock().clone()
    }

    pub fn push_output(&self, urn: impl Into<String>, data: Option<Value>) {
        self.outputs.lock().push(ResponseExtension {
            urn: urn.into(),
            data,
        });
    }

    pub fn outputs_snapshot(&self) -> Vec<ResponseExtension> {
        self.outputs.lock().clone()
    }

    // ── extension scratch space ───────────────────────────────────────

    pub fn set_scratch(&self, key: impl Into<String>, value: Value) {
        self.scratch.lock().insert(key.into(), value);
    }

    pub fn scratch(&self, key: &str) -> Option<Value> {
        self.scratch.lock().get(key).cloned()
    }

    pub fn take_scratch(&self, key: &str) -> Option<Value> {
        self.scratch.lock().remove(key)
    }

    // ── dry run ───────────────────────────────────────────────────────

    pub fn mark_dry_run(&self) {
        self.dry_run.store(true, Ordering::Relaxed);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }
}

/// Sleep until the instant, or forever when no deadline is set.
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn deadline_exceeded(specified_ms: Option<u64>, elapsed_ms: u64) -> ErrorObject {
    let mut err = ErrorObject::new(ErrorCode::DeadlineExceeded, "deadline exceeded");
    if let Some(specified) = specified_ms {
        err = err.with_details(serde_json::json!({
            "specified_ms": specified,
            "elapsed_ms": elapsed_ms,
        }));
    }
    err
}
