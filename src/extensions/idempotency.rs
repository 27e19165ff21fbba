//! Idempotency extension.
//!
//! A request declares `{"key": "<client key>", "ttl": <seconds>?}`. The
//! cache key is `(function urn, version, key)`; the stored entry carries
//! the canonical hash of the bound arguments and, once the first
//! execution finishes, its result.
//!
//! Single-writer lease per key: the first request inserts an in-flight
//! marker (take-lease), executes, then publishes. While the marker is
//! present, an equal-hash duplicate gets `IDEMPOTENCY_PROCESSING`; a
//! differing hash gets `IDEMPOTENCY_CONFLICT`. After publication an
//! equal-hash replay short-circuits with the stored result tagged
//! `status=cached`; error outcomes release the lease instead of being
//! cached, so a failed call can be retried with the same key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::canonical::content_hash;
use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::pipeline::{Extension, HookFlow, Outcome, Priority};

pub const IDEMPOTENCY_URN: &str = "urn:forrst:ext:idempotency";

const SCRATCH_KEY: &str = "idempotency.lease";

enum Entry {
    InFlight {
        args_hash: String,
    },
    Done {
        args_hash: String,
        result: Value,
        stored_at: Instant,
        ttl: Duration,
    },
}

pub struct IdempotencyExtension {
    cache: Mutex<HashMap<(String, String, String), Entry>>,
    default_ttl: Duration,
}

impl IdempotencyExtension {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn cache_key(ctx: &InvocationContext, key: &str) -> (String, String, String) {
        let descriptor = ctx.descriptor();
        (
            descriptor.urn.as_str().to_string(),
            descriptor.version.to_string(),
            key.to_string(),
        )
    }
}

fn conflict(key: &str) -> HookFlow {
    HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
        ErrorCode::IdempotencyConflict,
        format!("idempotency key '{key}' was already used with different arguments"),
    )
    .with_details(json!({ "key": key }))]))
}

#[async_trait]
impl Extension for IdempotencyExtension {
    fn urn(&self) -> &str {
        IDEMPOTENCY_URN
    }

    fn priority(&self) -> Priority {
        Priority::Idempotency
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let Some(key) = options.and_then(|o| o.get("key")).and_then(Value::as_str) else {
            return HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                ErrorCode::InvalidRequest,
                "idempotency extension requires a 'key' option",
            )
            .with_pointer("/extensions")]));
        };
        let ttl = options
            .and_then(|o| o.get("ttl"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl);
        let args_hash = content_hash(&Value::Object(ctx.args().clone()));
        let cache_key = Self::cache_key(ctx, key);

        let mut cache = self.cache.lock();
        match cache.get(&cache_key) {
            None => {}
            Some(Entry::InFlight { args_hash: held }) => {
                if *held == args_hash {
                    return HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                        ErrorCode::IdempotencyProcessing,
                        format!("a request with idempotency key '{key}' is still in flight"),
                    )
                    .with_details(json!({ "key": key }))]));
                }
                return conflict(key);
            }
            Some(Entry::Done {
                args_hash: stored_hash,
                result,
                stored_at,
                ttl: stored_ttl,
            }) => {
                if stored_at.elapsed() < *stored_ttl {
                    if *stored_hash != args_hash {
                        return conflict(key);
                    }
                    ctx.push_output(
                        IDEMPOTENCY_URN,
                        Some(json!({ "key": key, "status": "cached" })),
                    );
                    return HookFlow::ShortCircuit(Ok(result.clone()));
                }
                // expired entry, fall through and take the lease
            }
        }

        cache.insert(cache_key, Entry::InFlight { args_hash });
        ctx.set_scratch(SCRATCH_KEY, json!({ "key": key, "ttl": ttl.as_secs() }));
        HookFlow::Continue
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        outcome: &mut Outcome,
    ) {
        let Some(lease) = ctx.take_scratch(SCRATCH_KEY) else {
            return;
        };
        let key = lease["key"].as_str().unwrap_or_default().to_string();
        let ttl = Duration::from_secs(lease["ttl"].as_u64().unwrap_or(0));
        let cache_key = Self::cache_key(ctx, &key);

        let mut cache = self.cache.lock();
        match outcome {
            Ok(result) => {
                cache.insert(
                    cache_key,
                    Entry::Done {
                        args_hash: content_hash(&Value::Object(ctx.args().clone())),
                        result: result.clone(),
                        stored_at: Instant::now(),
                        ttl,
                    },
                );
                drop(cache);
                ctx.push_output(
                    IDEMPOTENCY_URN,
                    Some(json!({ "key": key, "status": "processed" })),
                );
            }
            Err(_) => {
                // release the lease so the caller may retry with this key
                cache.remove(&cache_key);
            }
        }
    }
}
