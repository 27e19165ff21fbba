//! Extension pipeline: before/around/after hooks around every invocation.
//!
//! Extensions plug into three hook points:
//!
//! ```text
//! before(ctx)          runs in priority order, may short-circuit
//! around(ctx, next)    forms a stack around the function invocation
//! after(ctx, outcome)  runs in reverse order, may adjust the outcome
//! ```
//!
//! The active set for one request is the union of always-on extensions and
//! those the request declares, sorted by fixed priority class:
//!
//! | Priority | Extension |
//! |----------|-----------|
//! | 1 | deadline |
//! | 2 | cancellation |
//! | 3 | tracing |
//! | 4 | idempotency |
//! | 5 | caching |
//! | 6 | quota |
//! | 7 | dry-run |
//! | 8 | async |
//! | 9 | observers (retry, stream marker) |
//!
//! A short-circuiting `before` stops descent, but the `after` hooks of
//! extensions already entered still run, in reverse order. The function
//! itself executes under a `select!` against the cancellation token and
//! the deadline timer; when both have fired, deadline wins.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::context::{wait_until, InvocationContext};
use crate::error::{map_internal, ErrorCode, ErrorObject};
use crate::function::FunctionDescriptor;

/// What one pipeline run produces: a result value or the error list.
pub type Outcome = Result<Value, Vec<ErrorObject>>;

/// Control flow decision of a `before` hook.
pub enum HookFlow {
    Continue,
    ShortCircuit(Outcome),
}

/// Fixed ordering classes. `before` hooks run ascending, `after` hooks
/// descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Deadline,
    Cancellation,
    Tracing,
    Idempotency,
    Caching,
    Quota,
    DryRun,
    Async,
    Observer,
}

/// The remainder of the around stack; call [`Next::run`] to descend.
pub struct Next<'a> {
    fut: BoxFuture<'a, Outcome>,
}

impl<'a> Next<'a> {
    pub async fn run(self) -> Outcome {
        self.fut.await
    }
}

#[async_trait]
pub trait Extension: Send + Sync {
    /// Identity URN (`urn:forrst:ext:<name>`).
    fn urn(&self) -> &str;

    fn priority(&self) -> Priority;

    /// Run on every request, even when not declared.
    fn always_runs(&self) -> bool {
        false
    }

    /// Whether a declaration of this extension makes sense for the
    /// resolved function. Declared-but-inapplicable requests fail with
    /// `EXTENSION_NOT_APPLICABLE`.
    fn applicable_to(&self, _descriptor: &FunctionDescriptor) -> bool {
        true
    }

    async fn before(&self, _ctx: &InvocationContext, _options: Option<&Value>) -> HookFlow {
        HookFlow::Continue
    }

    async fn around(
        &self,
        _ctx: &InvocationContext,
        _options: Option<&Value>,
        next: Next<'_>,
    ) -> Outcome {
        next.run().await
    }

    async fn after(
        &self,
        _ctx: &InvocationContext,
        _options: Option<&Value>,
        _outcome: &mut Outcome,
    ) {
    }
}

/// Ordered, startup-frozen set of extensions.
pub struct ExtensionRegistry {
    by_urn: HashMap<String, Arc<dyn Extension>>,
    ordered: Vec<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn build(extensions: Vec<Arc<dyn Extension>>) -> Result<Self> {
        let mut by_urn = HashMap::new();
        let mut ordered = extensions;
        // Stable sort keeps registration order within one priority class.
        ordered.sort_by_key(|e| e.priority());
        for ext in &ordered {
            if by_urn
                .insert(ext.urn().to_string(), ext.clone())
                .is_some()
            {
                bail!("duplicate extension registration for '{}'", ext.urn());
            }
        }
        Ok(Self { by_urn, ordered })
    }

    pub fn get(&self, urn: &str) -> Option<&Arc<dyn Extension>> {
        self.by_urn.get(urn)
    }

    pub fn urns(&self) -> Vec<&str> {
        self.ordered.iter().map(|e| e.urn()).collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// One extension activated for a request, with its declared options.
pub struct ActiveHook {
    pub ext: Arc<dyn Extension>,
    pub options: Option<Value>,
}

impl std::fmt::Debug for ActiveHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveHook")
            .field("ext", &self.ext.urn())
            .field("options", &self.options)
            .finish()
    }
}

/// Compute the active hook set for a request.
///
/// Fails when a declared URN is unknown (`EXTENSION_NOT_SUPPORTED`),
/// declared twice (`INVALID_REQUEST`), or inapplicable to the resolved
/// function (`EXTENSION_NOT_APPLICABLE`).
pub fn active_hooks(
    registry: &ExtensionRegistry,
    ctx: &InvocationContext,
) -> Result<Vec<ActiveHook>, ErrorObject> {
    let descriptor = ctx.descriptor();
    let request = ctx.request();

    let mut declared: HashMap<String, Option<Value>> = HashMap::new();
    let mut seen = HashSet::new();
    for decl in &request.extensions {
        if !seen.insert(decl.urn.clone()) {
            return Err(ErrorObject::new(
                ErrorCode::InvalidRequest,
                format!("extension '{}' declared more than once", decl.urn),
            )
            .with_pointer("/extensions"));
        }
        let Some(ext) = registry.get(&decl.urn) else {
            return Err(ErrorObject::new(
                ErrorCode::ExtensionNotSupported,
                format!("no extension registered for '{}'", decl.urn),
            )
            .with_details(serde_json::json!({ "extension": decl.urn })));
        };
        if !ext.applicable_to(descriptor) {
            return Err(ErrorObject::new(
                ErrorCode::ExtensionNotApplicable,
                format!(
                    "extension '{}' does not apply to '{}'",
                    decl.urn, descriptor.urn
                ),
            )
            .with_details(serde_json::json!({
                "extension": decl.urn,
                "function": descriptor.urn.as_str(),
            })));
        }
        declared.insert(decl.urn.clone(), decl.options.clone());
    }

    let mut hooks = Vec::new();
    for ext in &registry.ordered {
        if let Some(options) = declared.remove(ext.urn()) {
            hooks.push(ActiveHook {
                ext: ext.clone(),
                options,
            });
        } else if ext.always_runs() {
            hooks.push(ActiveHook {
                ext: ext.clone(),
                options: None,
            });
        }
    }
    Ok(hooks)
}

/// Run `before` hooks in order. On a short-circuit, returns the outcome
/// and how many hooks were entered (so the caller can unwind `after`
/// hooks for exactly those).
pub async fn run_before(hooks: &[ActiveHook], ctx: &InvocationContext) -> Option<(Outcome, usize)> {
    for (i, hook) in hooks.iter().enumerate() {
        match hook.ext.before(ctx, hook.options.as_ref()).await {
            HookFlow::Continue => {}
            HookFlow::ShortCircuit(outcome) => return Some((outcome, i + 1)),
        }
    }
    None
}

/// Run `after` hooks of the first `entered` hooks, in reverse order.
pub async fn run_after(
    hooks: &[ActiveHook],
    entered: usize,
    ctx: &InvocationContext,
    outcome: &mut Outcome,
) {
    for hook in hooks[..entered].iter().rev() {
        hook.ext.after(ctx, hook.options.as_ref(), outcome).await;
    }
}

/// Drive a full pipeline run: before hooks, around stack, guarded
/// invocation, after hooks.
pub async fn run(hooks: &[ActiveHook], ctx: &InvocationContext) -> Outcome {
    let mut outcome;
    let entered;
    match run_before(hooks, ctx).await {
        Some((short, count)) => {
            outcome = short;
            entered = count;
        }
        None => {
            outcome = descend(hooks, ctx).await;
            entered = hooks.len();
        }
    }
    run_after(hooks, entered, ctx, &mut outcome).await;
    outcome
}

/// Build and run the around stack; the innermost layer invokes the
/// function under cancellation and deadline guards.
fn descend<'a>(hooks: &'a [ActiveHook], ctx: &'a InvocationContext) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        match hooks.split_first() {
            None => invoke_guarded(ctx).await,
            Some((head, rest)) => {
                let next = Next {
                    fut: descend(rest, ctx),
                };
                head.ext.around(ctx, head.options.as_ref(), next).await
            }
        }
    })
}

/// Invoke the resolved function, racing the deadline and the cancellation
/// token. The `biased` ordering checks the deadline first so it wins ties
/// with explicit cancellation.
///
/// A panicking function body is caught here and routed through
/// [`map_internal`], so a buggy function yields an `INTERNAL_ERROR`
/// response instead of tearing down the worker.
pub async fn invoke_guarded(ctx: &InvocationContext) -> Outcome {
    if ctx.deadline_expired() || ctx.is_cancelled() {
        return Err(vec![ctx.cancellation_error()]);
    }
    let function = ctx.function().clone();
    let args = ctx.args().clone();
    let cancel = ctx.cancel_token();
    let deadline = ctx.deadline_instant();
    tokio::select! {
        biased;
        _ = wait_until(deadline) => Err(vec![ctx.cancellation_error()]),
        _ = cancel.cancelled() => Err(vec![ctx.cancellation_error()]),
        result = AssertUnwindSafe(function.invoke(ctx, args)).catch_unwind() => match result {
            Ok(outcome) => outcome.map_err(|e| vec![e]),
            Err(payload) => {
                let cause = panic_message(payload);
                tracing::error!(
                    function = %ctx.descriptor().urn,
                    request_id = %ctx.request_id(),
                    cause = %cause,
                    "function panicked"
                );
                Err(vec![map_internal(&anyhow::anyhow!(
                    "function panicked: {cause}"
                ))])
            }
        },
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Function, FunctionResult};
    use crate::protocol::{JsonMap, Request};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct Sleeper {
        descriptor: FunctionDescriptor,
        dur: Duration,
    }

    #[async_trait]
    impl Function for Sleeper {
        fn descriptor(&self) -> &FunctionDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
            ctx.sleep_cooperative(self.dur).await?;
            Ok(json!("done"))
        }
    }

    struct Recorder {
        urn: String,
        priority: Priority,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Extension for Recorder {
        fn urn(&self) -> &str {
            &self.urn
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn always_runs(&self) -> bool {
            true
        }

        async fn before(&self, _ctx: &InvocationContext, _options: Option<&Value>) -> HookFlow {
            self.log.lock().push(format!("before:{}", self.urn));
            HookFlow::Continue
        }

        async fn after(
            &self,
            _ctx: &InvocationContext,
            _options: Option<&Value>,
            _outcome: &mut Outcome,
        ) {
            self.log.lock().push(format!("after:{}", self.urn));
        }
    }

    fn request(extensions: Value) -> Request {
        Request::from_value(&json!({
            "protocol": {"name": "forrst", "version": "0.1.0"},
            "id": "r1",
            "call": {"function": "urn:acme:forrst:fn:sleep"},
            "extensions": extensions,
        }))
        .unwrap()
    }

    fn ctx_for(dur: Duration, extensions: Value) -> InvocationContext {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:sleep", "1.0.0").unwrap();
        InvocationContext::new(
            request(extensions),
            Arc::new(Sleeper { descriptor, dur }),
            JsonMap::new(),
            None,
        )
    }

    fn recorder_registry(log: &Arc<Mutex<Vec<String>>>) -> ExtensionRegistry {
        ExtensionRegistry::build(vec![
            Arc::new(Recorder {
                urn: "urn:forrst:ext:two".into(),
                priority: Priority::Caching,
                log: log.clone(),
            }),
            Arc::new(Recorder {
                urn: "urn:forrst:ext:one".into(),
                priority: Priority::Deadline,
                log: log.clone(),
            }),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_before_order_is_reverse_of_after_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recorder_registry(&log);
        let ctx = ctx_for(Duration::from_millis(0), json!([]));
        let hooks = active_hooks(&registry, &ctx).unwrap();
        let outcome = run(&hooks, &ctx).await;
        assert!(outcome.is_ok());

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec![
                "before:urn:forrst:ext:one",
                "before:urn:forrst:ext:two",
                "after:urn:forrst:ext:two",
                "after:urn:forrst:ext:one",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recorder_registry(&log);
        let ctx = ctx_for(
            Duration::from_millis(0),
            json!([{"urn": "urn:forrst:ext:mystery"}]),
        );
        let err = active_hooks(&registry, &ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExtensionNotSupported);
    }

    #[tokio::test]
    async fn test_duplicate_declaration_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recorder_registry(&log);
        let ctx = ctx_for(
            Duration::from_millis(0),
            json!([
                {"urn": "urn:forrst:ext:one"},
                {"urn": "urn:forrst:ext:one"}
            ]),
        );
        let err = active_hooks(&registry, &ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_short_circuit_still_unwinds_entered_afters() {
        struct Breaker {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Extension for Breaker {
            fn urn(&self) -> &str {
                "urn:forrst:ext:breaker"
            }

            fn priority(&self) -> Priority {
                Priority::Quota
            }

            fn always_runs(&self) -> bool {
                true
            }

            async fn before(
                &self,
                _ctx: &InvocationContext,
                _options: Option<&Value>,
            ) -> HookFlow {
                self.log.lock().push("before:breaker".into());
                HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                    ErrorCode::RateLimited,
                    "limit reached",
                )]))
            }

            async fn after(
                &self,
                _ctx: &InvocationContext,
                _options: Option<&Value>,
                _outcome: &mut Outcome,
            ) {
                self.log.lock().push("after:breaker".into());
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::build(vec![
            Arc::new(Recorder {
                urn: "urn:forrst:ext:one".into(),
                priority: Priority::Deadline,
                log: log.clone(),
            }),
            Arc::new(Breaker { log: log.clone() }),
            Arc::new(Recorder {
                urn: "urn:forrst:ext:late".into(),
                priority: Priority::Observer,
                log: log.clone(),
            }),
        ])
        .unwrap();

        let ctx = ctx_for(Duration::from_millis(0), json!([]));
        let hooks = active_hooks(&registry, &ctx).unwrap();
        let outcome = run(&hooks, &ctx).await;
        assert_eq!(outcome.unwrap_err()[0].code, ErrorCode::RateLimited);

        let entries = log.lock().clone();
        // The observer after the breaker never entered, so only the
        // entered hooks unwind.
        assert_eq!(
            entries,
            vec![
                "before:urn:forrst:ext:one",
                "before:breaker",
                "after:breaker",
                "after:urn:forrst:ext:one",
            ]
        );
    }

    #[tokio::test]
    async fn test_explicit_cancel_aborts_invocation() {
        let ctx = Arc::new(ctx_for(Duration::from_secs(30), json!([])));
        let token = ctx.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let outcome = invoke_guarded(&ctx).await;
        assert_eq!(outcome.unwrap_err()[0].code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_beats_cancel_on_tie() {
        let ctx = ctx_for(Duration::from_secs(30), json!([]));
        ctx.set_deadline(std::time::Instant::now(), 1);
        ctx.cancel();
        let outcome = invoke_guarded(&ctx).await;
        assert_eq!(outcome.unwrap_err()[0].code, ErrorCode::DeadlineExceeded);
    }
}
