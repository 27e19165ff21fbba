//! System functions, registered under the reserved namespace.
//!
//! | URN | Purpose |
//! |-----|---------|
//! | `urn:forrst:system:fn:ping` | liveness probe |
//! | `urn:forrst:system:fn:health` | node health summary |
//! | `urn:forrst:system:fn:capabilities` | protocol versions, extensions, limits |
//! | `urn:forrst:system:fn:describe` | discovery document |
//! | `urn:forrst:system:fn:operation.status` | poll an async operation |
//! | `urn:forrst:system:fn:operation.cancel` | cancel an async operation |
//! | `urn:forrst:system:fn:operation.list` | list the caller's operations |
//! | `urn:forrst:ext:cancellation:fn:cancel` | fire a cancellation token |
//!
//! The describe/capabilities functions need the finished registries, which
//! in turn contain these functions. [`SystemState`] breaks the cycle with
//! `OnceLock` slots that startup fills after `build()`.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::Config;
use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::extensions::cancellation::{CancelFunction, CancelRegistry};
use crate::function::{Function, FunctionDescriptor, FunctionResult};
use crate::operation::{OperationFilter, OperationStatus, OperationStore, MAX_LIST_LIMIT};
use crate::pipeline::ExtensionRegistry;
use crate::protocol::{JsonMap, PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::registry::{FunctionRegistry, RegistryBuilder};
use crate::schema::{ArgumentSchema, FieldSpec, FieldType};

/// Shared state behind the system function set.
pub struct SystemState {
    registry: OnceLock<Arc<FunctionRegistry>>,
    extensions: OnceLock<Arc<ExtensionRegistry>>,
    pub operations: Arc<dyn OperationStore>,
    pub node_id: String,
    request_max_bytes: usize,
    response_max_bytes: usize,
    operation_ttl_seconds: u64,
    started: Instant,
}

impl SystemState {
    pub fn new(config: &Config, operations: Arc<dyn OperationStore>) -> Self {
        Self {
            registry: OnceLock::new(),
            extensions: OnceLock::new(),
            operations,
            node_id: config.node.resolved_id(),
            request_max_bytes: config.limits.request_max_bytes,
            response_max_bytes: config.limits.response_max_bytes,
            operation_ttl_seconds: config.operations.ttl_seconds,
            started: Instant::now(),
        }
    }

    /// Fill the registry slots once startup has frozen them.
    pub fn attach(&self, registry: Arc<FunctionRegistry>, extensions: Arc<ExtensionRegistry>) {
        let _ = self.registry.set(registry);
        let _ = self.extensions.set(extensions);
    }

    fn registry(&self) -> Result<&Arc<FunctionRegistry>, ErrorObject> {
        self.registry.get().ok_or_else(|| {
            ErrorObject::new(ErrorCode::Unavailable, "server is still starting up")
        })
    }

    fn extensions(&self) -> Result<&Arc<ExtensionRegistry>, ErrorObject> {
        self.extensions.get().ok_or_else(|| {
            ErrorObject::new(ErrorCode::Unavailable, "server is still starting up")
        })
    }
}

/// Register the full system function set.
pub fn register_system_functions(
    builder: &mut RegistryBuilder,
    state: Arc<SystemState>,
    cancel_registry: Arc<CancelRegistry>,
) -> Result<()> {
    builder.register_system(Arc::new(PingFunction::new()))?;
    builder.register_system(Arc::new(HealthFunction::new(state.clone())))?;
    builder.register_system(Arc::new(CapabilitiesFunction::new(state.clone())))?;
    builder.register_system(Arc::new(DescribeFunction::new(state.clone())))?;
    builder.register_system(Arc::new(OperationStatusFunction::new(state.clone())))?;
    builder.register_system(Arc::new(OperationCancelFunction::new(state.clone())))?;
    builder.register_system(Arc::new(OperationListFunction::new(state)))?;
    builder.register_system(Arc::new(CancelFunction::new(cancel_registry)))?;
    Ok(())
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── ping ──────────────────────────────────────────────────────────────

pub struct PingFunction {
    descriptor: FunctionDescriptor,
}

impl PingFunction {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:forrst:system:fn:ping", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Liveness probe")
            .idempotent();
        Self { descriptor }
    }
}

impl Default for PingFunction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Function for PingFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
        Ok(json!({ "status": "healthy", "timestamp": iso_now() }))
    }
}

// ── health ────────────────────────────────────────────────────────────

pub struct HealthFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl HealthFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor = FunctionDescriptor::new("urn:forrst:system:fn:health", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Node health summary")
            .idempotent();
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for HealthFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
        let functions = self.state.registry().map(|r| r.len()).unwrap_or(0);
        let active = self.state.operations.active_count().await;
        Ok(json!({
            "status": "healthy",
            "node": self.state.node_id,
            "uptime": {
                "value": self.state.started.elapsed().as_secs(),
                "unit": "second",
            },
            "functions": functions,
            "operations": { "active": active },
        }))
    }
}

// ── capabilities ──────────────────────────────────────────────────────

pub struct CapabilitiesFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl CapabilitiesFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor = FunctionDescriptor::new("urn:forrst:system:fn:capabilities", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Protocol versions, extensions, and limits")
            .idempotent();
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for CapabilitiesFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
        let registry = self.state.registry()?;
        let extensions = self.state.extensions()?;
        Ok(json!({
            "protocol": { "name": PROTOCOL_NAME, "versions": [PROTOCOL_VERSION] },
            "functions": registry.list(),
            "extensions": extensions.urns(),
            "limits": {
                "request_max_bytes": self.state.request_max_bytes,
                "response_max_bytes": self.state.response_max_bytes,
                "operation_ttl_seconds": self.state.operation_ttl_seconds,
            },
        }))
    }
}

// ── describe ──────────────────────────────────────────────────────────

pub struct DescribeFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl DescribeFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor = FunctionDescriptor::new("urn:forrst:system:fn:describe", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Discovery document for registered functions")
            .with_arguments(ArgumentSchema::new(vec![
                FieldSpec::optional("function", FieldType::String),
                FieldSpec::optional("version", FieldType::String),
            ]))
            .idempotent();
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for DescribeFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let registry = self.state.registry()?;
        let extensions = self.state.extensions()?;
        let function = args.get("function").and_then(Value::as_str);
        let version = args.get("version").and_then(Value::as_str);

        let descriptors = registry.for_describe(function, version);
        if function.is_some() && descriptors.is_empty() {
            return Err(ErrorObject::new(
                ErrorCode::FunctionNotFound,
                format!(
                    "no discoverable function matches '{}'",
                    function.unwrap_or_default()
                ),
            ));
        }

        Ok(json!({
            "protocol": { "name": PROTOCOL_NAME, "version": PROTOCOL_VERSION },
            "node": self.state.node_id,
            "functions": descriptors.iter().map(|d| d.describe()).collect::<Vec<_>>(),
            "extensions": extensions.urns(),
        }))
    }
}

// ── operation.status ──────────────────────────────────────────────────

pub struct OperationStatusFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl OperationStatusFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor =
            FunctionDescriptor::new("urn:forrst:system:fn:operation.status", "1.0.0")
                .expect("static descriptor is valid")
                .with_summary("Poll an async operation")
                .with_arguments(ArgumentSchema::new(vec![FieldSpec::required(
                    "operation_id",
                    FieldType::String,
                )]))
                .with_errors(vec![ErrorCode::AsyncOperationNotFound])
                .idempotent();
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for OperationStatusFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let id = args["operation_id"].as_str().unwrap_or_default();
        let operation = self.state.operations.get(id, Some(&ctx.owner())).await?;
        Ok(serde_json::to_value(&operation)
            .map_err(|_| ErrorObject::new(ErrorCode::InternalError, "operation serialization"))?)
    }
}

// ── operation.cancel ──────────────────────────────────────────────────

pub struct OperationCancelFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl OperationCancelFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor =
            FunctionDescriptor::new("urn:forrst:system:fn:operation.cancel", "1.0.0")
                .expect("static descriptor is valid")
                .with_summary("Cancel a pending or processing async operation")
                .with_arguments(ArgumentSchema::new(vec![FieldSpec::required(
                    "operation_id",
                    FieldType::String,
                )]))
                .with_errors(vec![
                    ErrorCode::AsyncOperationNotFound,
                    ErrorCode::AsyncCannotCancel,
                ]);
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for OperationCancelFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let id = args["operation_id"].as_str().unwrap_or_default();
        let operation = self.state.operations.cancel(id, Some(&ctx.owner())).await?;
        Ok(serde_json::to_value(&operation)
            .map_err(|_| ErrorObject::new(ErrorCode::InternalError, "operation serialization"))?)
    }
}

// ── operation.list ────────────────────────────────────────────────────

pub struct OperationListFunction {
    descriptor: FunctionDescriptor,
    state: Arc<SystemState>,
}

impl OperationListFunction {
    pub fn new(state: Arc<SystemState>) -> Self {
        let descriptor = FunctionDescriptor::new("urn:forrst:system:fn:operation.list", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("List the caller's async operations, newest first")
            .with_arguments(ArgumentSchema::new(vec![
                FieldSpec::optional("status", FieldType::String),
                FieldSpec::optional("function", FieldType::String),
                FieldSpec::optional("limit", FieldType::Integer)
                    .with_default(json!(MAX_LIST_LIMIT)),
                FieldSpec::optional("cursor", FieldType::String),
            ]))
            .idempotent();
        Self { descriptor, state }
    }
}

#[async_trait]
impl Function for OperationListFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let status = match args.get("status").and_then(Value::as_str) {
            None => None,
            Some(raw) => Some(OperationStatus::parse(raw).ok_or_else(|| {
                ErrorObject::new(
                    ErrorCode::InvalidArguments,
                    format!("unknown operation status '{raw}'"),
                )
                .with_pointer("/call/arguments/status")
            })?),
        };
        let filter = OperationFilter {
            status,
            function: args
                .get("function")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(MAX_LIST_LIMIT as u64) as usize;
        let cursor = args.get("cursor").and_then(Value::as_str);

        let (operations, next_cursor) = self
            .state
            .operations
            .list(&ctx.owner(), filter, limit, cursor)
            .await?;
        Ok(json!({
            "operations": operations,
            "next_cursor": next_cursor,
        }))
    }
}
