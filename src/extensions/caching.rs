//! Caching extension.
//!
//! Applicable only to functions whose declared operation is `read`; a
//! cache hit skips the function body, which is never acceptable for a
//! mutating call.
//!
//! The ETag is the SHA-256 of the canonical JSON rendering of the result
//! (see [`crate::canonical`]). The extension remembers the last ETag per
//! `(function, version, argument hash)`. A request carrying a matching
//! `if_none_match` short-circuits in `before`: the function is not
//! invoked, the result is `null`, and the output reports
//! `cache_status = "hit"`. When no remembered ETag exists (first call,
//! entry expired), the function runs and the computed ETag is compared
//! post-hoc, stripping the body on a match; a miss returns the ETag for
//! the caller's next conditional request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::canonical::content_hash;
use crate::context::InvocationContext;
use crate::function::{FunctionDescriptor, OperationKind};
use crate::pipeline::{Extension, HookFlow, Outcome, Priority};

pub const CACHING_URN: &str = "urn:forrst:ext:caching";

const SCRATCH_KEY: &str = "caching.if_none_match";
const HIT_KEY: &str = "caching.hit";

/// How long a remembered ETag may satisfy conditional requests.
const ETAG_TTL: Duration = Duration::from_secs(300);

/// Entries beyond which stale ETags are pruned.
const PRUNE_THRESHOLD: usize = 4096;

struct EtagEntry {
    etag: String,
    stored_at: Instant,
}

pub struct CachingExtension {
    etags: Mutex<HashMap<(String, String, String), EtagEntry>>,
}

impl Default for CachingExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl CachingExtension {
    pub fn new() -> Self {
        Self {
            etags: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(ctx: &InvocationContext) -> (String, String, String) {
        let descriptor = ctx.descriptor();
        (
            descriptor.urn.as_str().to_string(),
            descriptor.version.to_string(),
            content_hash(&Value::Object(ctx.args().clone())),
        )
    }

    fn remembered_etag(&self, key: &(String, String, String)) -> Option<String> {
        let etags = self.etags.lock();
        let entry = etags.get(key)?;
        (entry.stored_at.elapsed() < ETAG_TTL).then(|| entry.etag.clone())
    }

    fn remember(&self, key: (String, String, String), etag: String) {
        let mut etags = self.etags.lock();
        if etags.len() > PRUNE_THRESHOLD {
            etags.retain(|_, entry| entry.stored_at.elapsed() < ETAG_TTL);
        }
        etags.insert(
            key,
            EtagEntry {
                etag,
                stored_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl Extension for CachingExtension {
    fn urn(&self) -> &str {
        CACHING_URN
    }

    fn priority(&self) -> Priority {
        Priority::Caching
    }

    fn applicable_to(&self, descriptor: &FunctionDescriptor) -> bool {
        descriptor.capabilities.operation == OperationKind::Read
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let Some(tag) = options
            .and_then(|o| o.get("if_none_match"))
            .and_then(Value::as_str)
        else {
            return HookFlow::Continue;
        };

        if self.remembered_etag(&Self::cache_key(ctx)).as_deref() == Some(tag) {
            ctx.set_scratch(HIT_KEY, json!(true));
            ctx.push_output(
                CACHING_URN,
                Some(json!({ "etag": tag, "cache_status": "hit" })),
            );
            return HookFlow::ShortCircuit(Ok(Value::Null));
        }

        ctx.set_scratch(SCRATCH_KEY, json!(tag));
        HookFlow::Continue
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        outcome: &mut Outcome,
    ) {
        if ctx.take_scratch(HIT_KEY).is_some() {
            return;
        }
        let Ok(result) = outcome else {
            return;
        };
        let etag = content_hash(result);
        self.remember(Self::cache_key(ctx), etag.clone());

        let matched = ctx
            .take_scratch(SCRATCH_KEY)
            .and_then(|v| v.as_str().map(|s| s == etag))
            .unwrap_or(false);

        if matched {
            *outcome = Ok(Value::Null);
            ctx.push_output(
                CACHING_URN,
                Some(json!({ "etag": etag, "cache_status": "hit" })),
            );
        } else {
            ctx.push_output(
                CACHING_URN,
                Some(json!({ "etag": etag, "cache_status": "miss" })),
            );
        }
    }
}
