//! Stream extension marker.
//!
//! The actual streaming happens in the SSE adapter at the transport; the
//! extension exists so that declaring `urn:forrst:ext:stream` is
//! recognized, and so the applicability check rejects it on functions
//! that do not declare the streamable capability.

use async_trait::async_trait;
use serde_json::Value;

use crate::function::FunctionDescriptor;
use crate::pipeline::{Extension, Priority};
use crate::protocol::Request;

pub const STREAM_URN: &str = "urn:forrst:ext:stream";

#[derive(Default)]
pub struct StreamExtension;

impl StreamExtension {
    pub fn new() -> Self {
        Self
    }
}

/// Whether a request asks for SSE delivery (`stream` declared with
/// `accept: true`).
pub fn wants_stream(request: &Request) -> bool {
    request
        .extension(STREAM_URN)
        .map(|decl| {
            decl.options
                .as_ref()
                .and_then(|o| o.get("accept"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

#[async_trait]
impl Extension for StreamExtension {
    fn urn(&self) -> &str {
        STREAM_URN
    }

    fn priority(&self) -> Priority {
        Priority::Observer
    }

    fn applicable_to(&self, descriptor: &FunctionDescriptor) -> bool {
        descriptor.capabilities.streamable
    }
}
