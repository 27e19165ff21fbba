//! Built-in extensions.
//!
//! | Extension | URN | Hook behavior |
//! |-----------|-----|---------------|
//! | deadline | `urn:forrst:ext:deadline` | stamps deadline, short-circuits when expired |
//! | cancellation | `urn:forrst:ext:cancellation` | maps client tokens to the request's cancel signal |
//! | tracing | `urn:forrst:ext:tracing` | trace/span ids, invocation span |
//! | idempotency | `urn:forrst:ext:idempotency` | replay cache with single-writer lease |
//! | caching | `urn:forrst:ext:caching` | ETag conditional requests for read functions |
//! | quota | `urn:forrst:ext:quota` | fixed-window admission control |
//! | dry-run | `urn:forrst:ext:dry-run` | validation-only short-circuit for write/delete functions |
//! | async | `urn:forrst:ext:async` | diverts execution to the operation store |
//! | retry | `urn:forrst:ext:retry` | response-only retry strategy on retryable errors |
//! | deprecation | `urn:forrst:ext:deprecation` | surfaces deprecation notes in meta |
//! | stream | `urn:forrst:ext:stream` | marker consumed by the SSE adapter |

pub mod async_op;
pub mod caching;
pub mod cancellation;
pub mod deadline;
pub mod deprecation;
pub mod dry_run;
pub mod idempotency;
pub mod quota;
pub mod retry;
pub mod stream;
pub mod tracing_ext;

use std::sync::Arc;

use crate::config::Config;
use crate::operation::OperationStore;
use crate::pipeline::Extension;

pub use cancellation::CancelRegistry;

/// The standard extension set, wired from config and shared state.
pub fn standard(
    config: &Config,
    cancel_registry: Arc<CancelRegistry>,
    operations: Arc<dyn OperationStore>,
) -> Vec<Arc<dyn Extension>> {
    vec![
        Arc::new(deadline::DeadlineExtension::new()),
        Arc::new(cancellation::CancellationExtension::new(cancel_registry)),
        Arc::new(tracing_ext::TracingExtension::new()),
        Arc::new(idempotency::IdempotencyExtension::new(
            std::time::Duration::from_secs(config.idempotency.ttl_seconds),
        )),
        Arc::new(caching::CachingExtension::new()),
        Arc::new(quota::QuotaExtension::new(
            config.quota.enabled,
            config.quota.limit,
            std::time::Duration::from_secs(config.quota.window_seconds),
        )),
        Arc::new(dry_run::DryRunExtension::new()),
        Arc::new(async_op::AsyncExtension::new(operations)),
        Arc::new(retry::RetryExtension::new()),
        Arc::new(deprecation::DeprecationExtension::new()),
        Arc::new(stream::StreamExtension::new()),
    ]
}
