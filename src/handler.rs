//! Request handler: parse → resolve → pipeline → assemble.
//!
//! [`RequestHandler::dispatch`] turns raw request bytes into a response
//! plus the HTTP status the transport should use. Every failure path
//! produces a well-formed response; only parse failures lose the id
//! (`id: null`, with the byte offset in `source.position`).
//!
//! ```text
//! bytes → size guard → JSON parse → batch check → field validation
//!       → envelope check → registry resolve → argument binding
//!       → InvocationContext → extension pipeline → assembly
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::config::Config;
use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::pipeline::{self, ExtensionRegistry, Outcome};
use crate::protocol::{check_envelope, JsonMap, Request, Response};
use crate::registry::FunctionRegistry;

/// A finished dispatch: the response and its HTTP status.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: u16,
    pub response: Response,
}

impl DispatchOutcome {
    fn from_response(response: Response) -> Self {
        Self {
            status: response.http_status(),
            response,
        }
    }
}

pub struct RequestHandler {
    registry: Arc<FunctionRegistry>,
    extensions: Arc<ExtensionRegistry>,
    node_id: String,
    request_max_bytes: usize,
    default_deadline: Option<Duration>,
    expose_internal_errors: bool,
}

impl RequestHandler {
    pub fn new(
        config: &Config,
        registry: Arc<FunctionRegistry>,
        extensions: Arc<ExtensionRegistry>,
    ) -> Self {
        Self {
            registry,
            extensions,
            node_id: config.node.resolved_id(),
            request_max_bytes: config.limits.request_max_bytes,
            default_deadline: config.deadline.default_deadline(),
            expose_internal_errors: config.server.expose_internal_errors,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Full dispatch from raw bytes.
    pub async fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        let started = Instant::now();
        match self.parse(raw, started) {
            Ok(request) => self.dispatch_request(request, started).await,
            Err(outcome) => outcome,
        }
    }

    /// Steps 1–3: size guard, JSON parse, batch rejection, field
    /// validation.
    pub fn parse(&self, raw: &[u8], started: Instant) -> Result<Request, DispatchOutcome> {
        if raw.len() > self.request_max_bytes {
            return Err(self.early_failure(
                None,
                ErrorObject::new(
                    ErrorCode::InvalidRequest,
                    format!(
                        "request of {} bytes exceeds the {} byte limit",
                        raw.len(),
                        self.request_max_bytes
                    ),
                ),
                started,
            ));
        }

        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(err) => {
                let position = byte_offset(raw, err.line(), err.column());
                return Err(self.early_failure(
                    None,
                    ErrorObject::new(ErrorCode::ParseError, format!("invalid JSON: {err}"))
                        .with_position(position),
                    started,
                ));
            }
        };

        if value.is_array() {
            return Err(self.early_failure(
                None,
                ErrorObject::new(
                    ErrorCode::InvalidRequest,
                    "batch requests are not supported",
                ),
                started,
            ));
        }

        Request::from_value(&value).map_err(|err| {
            // field validation failed, but the id may still be echoable
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            self.early_failure(id, err, started)
        })
    }

    /// Steps 4–6: envelope check, resolution, argument binding, context
    /// construction.
    pub fn prepare(
        &self,
        request: Request,
        started: Instant,
    ) -> Result<InvocationContext, DispatchOutcome> {
        let id = request.id.clone();

        if let Err(err) = check_envelope(&request.protocol) {
            return Err(self.early_failure(Some(id), err, started));
        }

        let function = match self
            .registry
            .resolve(&request.call.function, request.call.version.as_deref())
        {
            Ok(function) => function,
            Err(err) => return Err(self.early_failure(Some(id), err, started)),
        };

        let args = match function
            .descriptor()
            .arguments
            .bind(request.call.arguments.as_ref())
        {
            Ok(args) => args,
            Err(err) => return Err(self.early_failure(Some(id), err, started)),
        };

        Ok(InvocationContext::new(
            request,
            function,
            args,
            self.default_deadline,
        ))
    }

    /// Steps 7–9 for an already validated request.
    pub async fn dispatch_request(&self, request: Request, started: Instant) -> DispatchOutcome {
        let ctx = match self.prepare(request, started) {
            Ok(ctx) => ctx,
            Err(outcome) => return outcome,
        };
        self.dispatch_prepared(&ctx).await
    }

    /// Run the pipeline for a prepared context and assemble the response.
    pub async fn dispatch_prepared(&self, ctx: &InvocationContext) -> DispatchOutcome {
        let outcome = match pipeline::active_hooks(&self.extensions, ctx) {
            Ok(hooks) => pipeline::run(&hooks, ctx).await,
            Err(err) => Err(vec![err]),
        };
        self.assemble(ctx, outcome)
    }

    /// Fold the outcome, context meta, and extension outputs into a
    /// response.
    pub fn assemble(&self, ctx: &InvocationContext, outcome: Outcome) -> DispatchOutcome {
        let mut response = match outcome {
            Ok(result) => Response::success(ctx.request_id(), result),
            Err(mut errors) => {
                self.scrub_internal(&mut errors);
                Response::failure(Some(ctx.request_id().to_string()), errors)
            }
        };
        response = response.with_extensions(ctx.outputs_snapshot());
        response.meta = self.stamp_meta(ctx.meta_snapshot(), ctx.elapsed_ms());
        DispatchOutcome::from_response(response)
    }

    /// A failure response for requests that never reached the pipeline.
    fn early_failure(
        &self,
        id: Option<String>,
        error: ErrorObject,
        started: Instant,
    ) -> DispatchOutcome {
        let mut response = Response::failure(id, vec![error]);
        response.meta = self.stamp_meta(
            JsonMap::new(),
            started.elapsed().as_millis() as u64,
        );
        DispatchOutcome::from_response(response)
    }

    /// Internal-error detail (the `cause` attached by
    /// [`crate::error::map_internal`], or anything a function put on an
    /// `INTERNAL_ERROR` of its own) stays server-side unless configured
    /// otherwise.
    pub(crate) fn scrub_internal(&self, errors: &mut [ErrorObject]) {
        if self.expose_internal_errors {
            return;
        }
        for error in errors {
            if error.code == ErrorCode::InternalError {
                error.details = None;
            }
        }
    }

    fn stamp_meta(&self, mut meta: JsonMap, elapsed_ms: u64) -> JsonMap {
        meta.insert(
            "duration".to_string(),
            json!({ "value": elapsed_ms, "unit": "millisecond" }),
        );
        meta.insert("node".to_string(), json!(self.node_id));
        meta
    }
}

/// Translate serde's 1-based line/column into a byte offset.
fn byte_offset(raw: &[u8], line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let mut seen_lines = 1;
    let mut offset = 0;
    for (i, &b) in raw.iter().enumerate() {
        if seen_lines == line {
            offset = i;
            break;
        }
        if b == b'\n' {
            seen_lines += 1;
            offset = i + 1;
        }
    }
    (offset + column.saturating_sub(1)).min(raw.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset_single_line() {
        let raw = b"{\"a\": }";
        // column 7 points at the '}' after the space
        assert_eq!(byte_offset(raw, 1, 7), 6);
    }

    #[test]
    fn test_byte_offset_multi_line() {
        let raw = b"{\n  \"a\": }";
        assert_eq!(byte_offset(raw, 2, 8), 9);
    }

    #[test]
    fn test_byte_offset_clamps() {
        assert_eq!(byte_offset(b"{}", 9, 9), 2);
    }
}
