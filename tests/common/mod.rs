//! Shared fixtures for integration tests: a runtime with a small function
//! set and helpers for driving `RequestHandler::dispatch` with raw bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use forrst::config::Config;
use forrst::context::InvocationContext;
use forrst::function::{ChunkSender, Function, FunctionDescriptor, FunctionResult, OperationKind};
use forrst::protocol::JsonMap;
use forrst::runtime::ServerContext;
use forrst::schema::{ArgumentSchema, FieldSpec, FieldType};

pub fn runtime() -> ServerContext {
    runtime_with(Config::default())
}

pub fn runtime_with(config: Config) -> ServerContext {
    ServerContext::initialize(config, fixtures()).expect("runtime initializes")
}

pub fn fixtures() -> Vec<Arc<dyn Function>> {
    vec![
        Arc::new(Calculator::new("1.0.0")),
        Arc::new(Calculator::new("2.0.0")),
        Arc::new(Calculator::new("3.0.0-beta.2")),
        Arc::new(Echo::new()),
        Arc::new(Sleep::new()),
        Arc::new(Lookup::new()),
        Arc::new(Counter::new()),
        Arc::new(Failing::new()),
        Arc::new(Panicking::new()),
    ]
}

/// Dispatch a JSON document and return `(http_status, response_json)`.
pub async fn call(ctx: &ServerContext, body: &Value) -> (u16, Value) {
    let raw = serde_json::to_vec(body).unwrap();
    let outcome = ctx.handler.dispatch(&raw).await;
    let response = serde_json::to_value(&outcome.response).unwrap();
    (outcome.status, response)
}

/// Minimal request document.
pub fn request(id: &str, function: &str) -> Value {
    json!({
        "protocol": {"name": "forrst", "version": "0.1.0"},
        "id": id,
        "call": {"function": function}
    })
}

/// Extension output entry for a URN, if present.
pub fn ext_data<'a>(response: &'a Value, urn: &str) -> Option<&'a Value> {
    response
        .get("extensions")?
        .as_array()?
        .iter()
        .find(|e| e["urn"] == urn)?
        .get("data")
}

// ── fixture functions ─────────────────────────────────────────────────

pub struct Calculator {
    descriptor: FunctionDescriptor,
}

impl Calculator {
    pub fn new(version: &str) -> Self {
        let mut descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:math.calculator", version)
            .unwrap()
            .with_summary("Add two numbers")
            .with_arguments(ArgumentSchema::new(vec![
                FieldSpec::optional("a", FieldType::Number).with_default(json!(0)),
                FieldSpec::optional("b", FieldType::Number).with_default(json!(0)),
            ]))
            .idempotent();
        if version == "1.0.0" {
            descriptor = descriptor.deprecated("superseded by 2.0.0");
        }
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Calculator {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({
            "sum": a + b,
            "version": self.descriptor.version.to_string(),
        }))
    }
}

pub struct Echo {
    descriptor: FunctionDescriptor,
}

impl Echo {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:echo", "1.0.0")
            .unwrap()
            .with_arguments(ArgumentSchema::empty().open())
            .idempotent();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Echo {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        Ok(Value::Object(args))
    }
}

pub struct Sleep {
    descriptor: FunctionDescriptor,
}

impl Sleep {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:slow.sleep", "1.0.0")
            .unwrap()
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::optional(
                "duration_ms",
                FieldType::Integer,
            )
            .with_default(json!(50))]))
            .operation(OperationKind::Write);
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Sleep {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let duration_ms = args
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(50);
        ctx.sleep_cooperative(Duration::from_millis(duration_ms))
            .await?;
        Ok(json!({ "slept_ms": duration_ms }))
    }
}

/// A read function with a noticeable cost, for asserting that cache hits
/// genuinely skip the body.
pub struct Lookup {
    descriptor: FunctionDescriptor,
}

impl Lookup {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:slow.lookup", "1.0.0")
            .unwrap()
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::optional(
                "duration_ms",
                FieldType::Integer,
            )
            .with_default(json!(150))]))
            .idempotent();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Lookup {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let duration_ms = args
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(150);
        ctx.sleep_cooperative(Duration::from_millis(duration_ms))
            .await?;
        Ok(json!({ "rows": [1, 2, 3] }))
    }
}

pub struct Failing {
    descriptor: FunctionDescriptor,
}

impl Failing {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:always.fails", "1.0.0")
            .unwrap()
            .hidden();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Failing {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
        Err(forrst::error::ErrorObject::new(
            forrst::error::ErrorCode::InternalError,
            "internal server error",
        )
        .with_details(json!({"cause": "connection string leaked"})))
    }
}

pub struct Panicking {
    descriptor: FunctionDescriptor,
}

impl Panicking {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:always.panics", "1.0.0")
            .unwrap()
            .hidden();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Panicking {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, _args: JsonMap) -> FunctionResult {
        panic!("boom in function body");
    }
}

pub struct Counter {
    descriptor: FunctionDescriptor,
}

impl Counter {
    pub fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:stream.counter", "1.0.0")
            .unwrap()
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::optional(
                "count",
                FieldType::Integer,
            )
            .with_default(json!(3))]))
            .streamable();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for Counter {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(3);
        Ok(json!({ "values": (0..count).collect::<Vec<_>>() }))
    }

    async fn invoke_stream(
        &self,
        ctx: &InvocationContext,
        args: JsonMap,
        tx: ChunkSender,
    ) -> FunctionResult {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(3);
        for i in 0..count {
            ctx.check_cancelled()?;
            if tx.send(json!({ "value": i })).await.is_err() {
                break;
            }
        }
        Ok(json!({ "count": count }))
    }
}
