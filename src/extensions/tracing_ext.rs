//! Tracing extension.
//!
//! Propagates `{trace_id, span_id, baggage}` from the caller (generating
//! ids when absent), wraps the invocation in a `tracing` span via the
//! around hook, and reports the span identity plus wall time in its
//! output. The trace id is also surfaced in response meta.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::context::InvocationContext;
use crate::pipeline::{Extension, HookFlow, Next, Outcome, Priority};

pub const TRACING_URN: &str = "urn:forrst:ext:tracing";

const SCRATCH_KEY: &str = "tracing.ids";

#[derive(Default)]
pub struct TracingExtension;

impl TracingExtension {
    pub fn new() -> Self {
        Self
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[async_trait]
impl Extension for TracingExtension {
    fn urn(&self) -> &str {
        TRACING_URN
    }

    fn priority(&self) -> Priority {
        Priority::Tracing
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let trace_id = options
            .and_then(|o| o.get("trace_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let parent_span_id = options
            .and_then(|o| o.get("span_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let baggage = options.and_then(|o| o.get("baggage")).cloned();
        let span_id = short_id();

        ctx.set_meta("trace_id", json!(trace_id));
        ctx.set_scratch(
            SCRATCH_KEY,
            json!({
                "trace_id": trace_id,
                "span_id": span_id,
                "parent_span_id": parent_span_id,
                "baggage": baggage,
            }),
        );
        HookFlow::Continue
    }

    async fn around(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        next: Next<'_>,
    ) -> Outcome {
        let ids = ctx.scratch(SCRATCH_KEY).unwrap_or_default();
        let span = tracing::info_span!(
            "invoke",
            function = %ctx.descriptor().urn,
            request_id = %ctx.request_id(),
            trace_id = ids["trace_id"].as_str().unwrap_or(""),
            span_id = ids["span_id"].as_str().unwrap_or(""),
        );
        next.run().instrument(span).await
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        _outcome: &mut Outcome,
    ) {
        let Some(ids) = ctx.take_scratch(SCRATCH_KEY) else {
            return;
        };
        ctx.push_output(
            TRACING_URN,
            Some(json!({
                "trace_id": ids["trace_id"],
                "span_id": ids["span_id"],
                "parent_span_id": ids["parent_span_id"],
                "duration_ms": ctx.elapsed_ms(),
            })),
        );
    }
}
